//! Lifecycle tracing.
//!
//! A [`Tracer`] is attached to a request when tracing is enabled and
//! threaded through the dialer and connection. Each hook records a
//! timestamp; [`TraceInfo`] derives the user-facing durations and is
//! published on the `Response`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Derived timings for one request, exposed on the response.
#[derive(Debug, Clone, Default)]
pub struct TraceInfo {
    pub dns_lookup_time: Duration,
    pub connect_time: Duration,
    pub tls_handshake_time: Duration,
    /// From connection-ready to the first response byte.
    pub first_response_time: Duration,
    /// From the first response byte to response completion.
    pub response_time: Duration,
    pub total_time: Duration,
    pub remote_addr: Option<SocketAddr>,
    pub is_conn_reused: bool,
    pub is_conn_was_idle: bool,
    pub conn_idle_time: Duration,
}

#[derive(Debug, Default)]
struct Times {
    start: Option<Instant>,
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    connect_start: Option<Instant>,
    connect_done: Option<Instant>,
    tls_start: Option<Instant>,
    tls_done: Option<Instant>,
    got_conn: Option<Instant>,
    wrote_request: Option<Instant>,
    first_byte: Option<Instant>,
    done: Option<Instant>,
    reused: bool,
    idle_time: Option<Duration>,
    remote_addr: Option<SocketAddr>,
}

/// Hook recorder; cheap clone, no-op when tracing is disabled.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tracer {
    times: Option<Arc<Mutex<Times>>>,
}

macro_rules! hook {
    ($name:ident) => {
        pub(crate) fn $name(&self) {
            if let Some(times) = &self.times {
                times.lock().$name = Some(Instant::now());
            }
        }
    };
}

impl Tracer {
    pub(crate) fn disabled() -> Self {
        Self { times: None }
    }

    pub(crate) fn enabled() -> Self {
        let times = Times {
            start: Some(Instant::now()),
            ..Default::default()
        };
        Self {
            times: Some(Arc::new(Mutex::new(times))),
        }
    }

    hook!(dns_start);
    hook!(dns_done);
    hook!(connect_start);
    hook!(connect_done);
    hook!(tls_start);
    hook!(tls_done);
    hook!(wrote_request);
    hook!(done);

    /// First response byte; only the earliest call sticks, H1 and H2
    /// both report it from their read paths.
    pub(crate) fn first_byte(&self) {
        if let Some(times) = &self.times {
            let mut times = times.lock();
            if times.first_byte.is_none() {
                times.first_byte = Some(Instant::now());
            }
        }
    }

    pub(crate) fn got_conn(&self, reused: bool, idle_time: Option<Duration>) {
        if let Some(times) = &self.times {
            let mut times = times.lock();
            times.got_conn = Some(Instant::now());
            times.reused = reused;
            times.idle_time = idle_time;
        }
    }

    pub(crate) fn remote_addr(&self, addr: SocketAddr) {
        if let Some(times) = &self.times {
            times.lock().remote_addr = Some(addr);
        }
    }

    /// Derives the published timings; `None` when tracing is off.
    pub(crate) fn finish(&self) -> Option<TraceInfo> {
        let times = self.times.as_ref()?;
        let times = times.lock();

        let span = |a: Option<Instant>, b: Option<Instant>| match (a, b) {
            (Some(a), Some(b)) => b.saturating_duration_since(a),
            _ => Duration::ZERO,
        };

        Some(TraceInfo {
            dns_lookup_time: span(times.dns_start, times.dns_done),
            connect_time: span(times.connect_start, times.connect_done),
            tls_handshake_time: span(times.tls_start, times.tls_done),
            first_response_time: span(times.got_conn, times.first_byte),
            response_time: span(times.first_byte, times.done),
            total_time: span(times.start, times.done.or(Some(Instant::now()))),
            remote_addr: times.remote_addr,
            is_conn_reused: times.reused,
            is_conn_was_idle: times.idle_time.is_some(),
            conn_idle_time: times.idle_time.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracer_records_nothing() {
        let tracer = Tracer::disabled();
        tracer.dns_start();
        tracer.done();
        assert!(tracer.finish().is_none());
    }

    #[test]
    fn derived_spans_are_consistent() {
        let tracer = Tracer::enabled();
        tracer.dns_start();
        tracer.dns_done();
        tracer.connect_start();
        tracer.connect_done();
        tracer.got_conn(true, Some(Duration::from_millis(12)));
        tracer.wrote_request();
        tracer.first_byte();
        tracer.first_byte(); // second call must not move the mark
        tracer.done();

        let info = tracer.finish().unwrap();
        assert!(info.is_conn_reused);
        assert!(info.is_conn_was_idle);
        assert_eq!(info.conn_idle_time, Duration::from_millis(12));
        assert!(info.total_time >= info.response_time);
    }
}
