//! Banned peer addresses consulted during handshakes.

use dashmap::DashSet;
use peerlink_transport::Address;
use std::sync::Arc;

/// Shared set of banned addresses.
///
/// Cloning shares the underlying set, so an application can keep a handle and
/// ban peers while nodes are running.
#[derive(Debug, Clone, Default)]
pub struct BanList {
    banned: Arc<DashSet<Address>>,
}

impl BanList {
    /// Empty ban list
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban an address; returns false if it was already banned
    pub fn ban(&self, address: Address) -> bool {
        let inserted = self.banned.insert(address.clone());
        if inserted {
            tracing::info!("Banned peer address {}", address);
        }
        inserted
    }

    /// Lift a ban; returns false if the address was not banned
    pub fn unban(&self, address: &Address) -> bool {
        self.banned.remove(address).is_some()
    }

    /// Returns true if `address` is banned
    pub fn is_banned(&self, address: &Address) -> bool {
        self.banned.contains(address)
    }

    /// Number of banned addresses
    pub fn len(&self) -> usize {
        self.banned.len()
    }

    /// Returns true if nothing is banned
    pub fn is_empty(&self) -> bool {
        self.banned.is_empty()
    }
}

impl FromIterator<Address> for BanList {
    fn from_iter<I: IntoIterator<Item = Address>>(iter: I) -> Self {
        let list = BanList::new();
        for address in iter {
            list.banned.insert(address);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_and_unban() {
        let list = BanList::new();
        let peer = Address::localhost(1234);
        assert!(!list.is_banned(&peer));

        assert!(list.ban(peer.clone()));
        assert!(!list.ban(peer.clone()));
        assert!(list.is_banned(&"localhost:1234".parse().unwrap()));

        let shared = list.clone();
        assert!(shared.unban(&peer));
        assert!(list.is_empty());
    }

    #[test]
    fn test_from_iter() {
        let list: BanList = [Address::localhost(1), Address::localhost(2)]
            .into_iter()
            .collect();
        assert_eq!(list.len(), 2);
    }
}
