//! Built-in data-center address tables.

use std::collections::BTreeMap;

const PRODUCTION: &[(i32, &str)] = &[
    (1, "149.154.175.53:443"),
    (2, "149.154.167.51:443"),
    (3, "149.154.175.100:443"),
    (4, "149.154.167.91:443"),
    (5, "91.108.56.130:443"),
];

const TEST: &[(i32, &str)] = &[
    (1, "149.154.175.10:443"),
    (2, "149.154.167.40:443"),
    (3, "149.154.175.117:443"),
];

/// Where each DC lives, as `ip:port` for the TCP transport.
///
/// HTTP connections use the same host on port 80
/// (see [`http_address`](crate::transport::http::http_address)).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DcOptions {
    addrs: BTreeMap<i32, String>,
}

impl DcOptions {
    /// The production DCs.
    pub fn production() -> Self { Self::from_table(PRODUCTION) }

    /// The test DCs.
    pub fn test() -> Self { Self::from_table(TEST) }

    /// Production or test, by flag.
    pub fn for_mode(test_mode: bool) -> Self {
        if test_mode { Self::test() } else { Self::production() }
    }

    /// An empty table, to be filled with [`set`](Self::set).
    pub fn empty() -> Self { Self { addrs: BTreeMap::new() } }

    fn from_table(table: &[(i32, &str)]) -> Self {
        Self { addrs: table.iter().map(|&(id, addr)| (id, addr.to_string())).collect() }
    }

    /// Address of `dc_id`.
    pub fn address(&self, dc_id: i32) -> Option<&str> {
        self.addrs.get(&dc_id).map(String::as_str)
    }

    /// Add or replace the address of `dc_id`.
    pub fn set(&mut self, dc_id: i32, addr: impl Into<String>) {
        self.addrs.insert(dc_id, addr.into());
    }

    /// Known DC ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.addrs.keys().copied()
    }
}

impl Default for DcOptions {
    fn default() -> Self { Self::production() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables() {
        let prod = DcOptions::production();
        assert_eq!(prod.ids().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(prod.address(2), Some("149.154.167.51:443"));

        let test = DcOptions::for_mode(true);
        assert_eq!(test.address(2), Some("149.154.167.40:443"));
        assert_eq!(test.address(4), None);
    }

    #[test]
    fn overrides() {
        let mut dcs = DcOptions::empty();
        dcs.set(7, "127.0.0.1:4430");
        assert_eq!(dcs.address(7), Some("127.0.0.1:4430"));
    }
}
