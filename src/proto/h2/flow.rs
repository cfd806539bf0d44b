//! Flow-control window arithmetic.

use super::frame::{MAX_INITIAL_WINDOW_SIZE, Reason};

/// A send or receive window. Windows may legitimately go negative on
/// the send side when the peer shrinks SETTINGS_INITIAL_WINDOW_SIZE
/// mid-flight.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowControl {
    window: i64,
}

impl FlowControl {
    pub(crate) fn new(size: u32) -> Self {
        Self {
            window: size as i64,
        }
    }

    /// Bytes currently available to send (zero when the window is
    /// negative).
    pub(crate) fn available(&self) -> u32 {
        self.window.max(0).min(u32::MAX as i64) as u32
    }

    pub(crate) fn is_stalled(&self) -> bool {
        self.window <= 0
    }

    /// Consumes `n` bytes of capacity.
    pub(crate) fn claim(&mut self, n: u32) {
        debug_assert!(n as i64 <= self.window);
        self.window -= n as i64;
    }

    /// Grants `n` bytes of capacity (WINDOW_UPDATE received, or consumed
    /// receive bytes released). Overflow past 2^31-1 is a flow-control
    /// violation.
    pub(crate) fn grant(&mut self, n: u32) -> Result<(), Reason> {
        let next = self.window + n as i64;
        if next > MAX_INITIAL_WINDOW_SIZE as i64 {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.window = next;
        Ok(())
    }

    /// Applies an initial-window-size delta from a SETTINGS change.
    pub(crate) fn shift(&mut self, delta: i64) {
        self.window += delta;
    }

    /// Records `n` received bytes against this receive window; a peer
    /// overshooting its budget is a violation.
    pub(crate) fn receive(&mut self, n: u32) -> Result<(), Reason> {
        if n as i64 > self.window {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.window -= n as i64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_grant() {
        let mut flow = FlowControl::new(10);
        flow.claim(10);
        assert!(flow.is_stalled());
        flow.grant(5).unwrap();
        assert_eq!(flow.available(), 5);
    }

    #[test]
    fn grant_overflow_is_an_error() {
        let mut flow = FlowControl::new(MAX_INITIAL_WINDOW_SIZE);
        assert_eq!(flow.grant(1).unwrap_err(), Reason::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn settings_shift_can_go_negative() {
        let mut flow = FlowControl::new(100);
        flow.claim(80);
        flow.shift(-50);
        assert!(flow.is_stalled());
        assert_eq!(flow.available(), 0);
        flow.grant(40).unwrap();
        assert_eq!(flow.available(), 10);
    }

    #[test]
    fn peer_overshoot_is_detected() {
        let mut flow = FlowControl::new(10);
        assert!(flow.receive(10).is_ok());
        assert_eq!(flow.receive(1).unwrap_err(), Reason::FLOW_CONTROL_ERROR);
    }
}
