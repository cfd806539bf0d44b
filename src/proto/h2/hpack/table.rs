use std::collections::VecDeque;

use bytes::Bytes;

/// The HPACK static table, RFC 7541 Appendix A. Index space starts at 1.
pub(super) const STATIC_TABLE: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// Best static-table match for a field: `Full` beats `Name`.
pub(super) enum StaticMatch {
    Full(usize),
    Name(usize),
    None,
}

pub(super) fn static_lookup(name: &[u8], value: &[u8]) -> StaticMatch {
    let mut name_idx = None;
    for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if *n == name {
            if *v == value {
                return StaticMatch::Full(i + 1);
            }
            if name_idx.is_none() {
                name_idx = Some(i + 1);
            }
        }
    }
    match name_idx {
        Some(i) => StaticMatch::Name(i),
        None => StaticMatch::None,
    }
}

/// The dynamic table shared shape for both compression directions.
///
/// New entries go to the front; index 62 is the most recent insertion.
/// Size accounting per RFC 7541 section 4.1: entry size is name length
/// plus value length plus 32.
#[derive(Debug)]
pub(super) struct DynamicTable {
    entries: VecDeque<(Bytes, Bytes)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub(super) fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub(super) fn max_size(&self) -> usize {
        self.max_size
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    /// 0-based position into the dynamic table; the caller handles the
    /// static offset.
    pub(super) fn get(&self, at: usize) -> Option<(&Bytes, &Bytes)> {
        self.entries.get(at).map(|(n, v)| (n, v))
    }

    pub(super) fn insert(&mut self, name: Bytes, value: Bytes) {
        let entry_size = name.len() + value.len() + 32;

        // An entry larger than the table empties it.
        while self.size + entry_size > self.max_size {
            match self.entries.pop_back() {
                Some((n, v)) => self.size -= n.len() + v.len() + 32,
                None => break,
            }
        }

        if entry_size <= self.max_size {
            self.size += entry_size;
            self.entries.push_front((name, value));
        }
    }

    pub(super) fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.size > max_size {
            if let Some((n, v)) = self.entries.pop_back() {
                self.size -= n.len() + v.len() + 32;
            }
        }
    }

    /// Full then name match, as 0-based dynamic positions.
    pub(super) fn lookup(&self, name: &[u8], value: &[u8]) -> (Option<usize>, Option<usize>) {
        let mut name_at = None;
        for (at, (n, v)) in self.entries.iter().enumerate() {
            if n.as_ref() == name {
                if v.as_ref() == value {
                    return (Some(at), name_at);
                }
                if name_at.is_none() {
                    name_at = Some(at);
                }
            }
        }
        (None, name_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_is_fifo_and_size_tracked() {
        // each entry is 1 + 1 + 32 = 34 bytes
        let mut table = DynamicTable::new(70);
        table.insert(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        table.insert(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        assert_eq!(table.len(), 2);

        // inserting a third evicts the oldest ("a")
        table.insert(Bytes::from_static(b"c"), Bytes::from_static(b"3"));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).map(|(n, _)| n.as_ref()), Some(&b"c"[..]));
        assert_eq!(table.get(1).map(|(n, _)| n.as_ref()), Some(&b"b"[..]));
    }

    #[test]
    fn resize_evicts() {
        let mut table = DynamicTable::new(200);
        table.insert(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        table.insert(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        table.resize(34);
        assert_eq!(table.len(), 1);
        assert_eq!(table.max_size(), 34);
    }

    #[test]
    fn oversized_entry_clears_table() {
        let mut table = DynamicTable::new(40);
        table.insert(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        table.insert(Bytes::from_static(b"name"), Bytes::from(vec![b'x'; 64]));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn static_lookup_prefers_full_match() {
        assert!(matches!(
            static_lookup(b":method", b"GET"),
            StaticMatch::Full(2)
        ));
        assert!(matches!(
            static_lookup(b":method", b"PATCH"),
            StaticMatch::Name(2)
        ));
        assert!(matches!(static_lookup(b"x-custom", b""), StaticMatch::None));
    }
}
