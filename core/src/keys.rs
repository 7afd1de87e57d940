//! Key layout of the shared store.
//!
//! Counters, reservations, settlement records and locks live in distinct
//! namespaces of the same store. Every adapter builds keys through these helpers so the layout is
//! defined once.

use crate::types::{ProductId, Resource, UserId};

/// Prefix of per-product stock counters.
pub const STOCK_PREFIX: &str = "stock:";

/// Prefix of reservation records.
pub const RESERVATION_PREFIX: &str = "reservation:";

/// Prefix of the per-product reservation index sets.
pub const RESERVATION_INDEX_PREFIX: &str = "reservation-index:";

/// Prefix of per-product settlement records (epoch and in-flight confirmations).
pub const SETTLEMENT_PREFIX: &str = "settlement:";

/// Prefix of distributed locks.
pub const LOCK_PREFIX: &str = "lock:";

/// Resource name of the global catalog import lock.
pub const CATALOG_IMPORT_RESOURCE: &str = "catalog-import";

/// `stock:<productId>`
#[must_use]
pub fn stock_key(product_id: &ProductId) -> String {
    format!("{STOCK_PREFIX}{product_id}")
}

/// `reservation:<userId>:<productId>`
#[must_use]
pub fn reservation_key(user_id: &UserId, product_id: &ProductId) -> String {
    format!("{RESERVATION_PREFIX}{user_id}:{product_id}")
}

/// `reservation-index:<productId>`
#[must_use]
pub fn reservation_index_key(product_id: &ProductId) -> String {
    format!("{RESERVATION_INDEX_PREFIX}{product_id}")
}

/// `settlement:<productId>`
#[must_use]
pub fn settlement_key(product_id: &ProductId) -> String {
    format!("{SETTLEMENT_PREFIX}{product_id}")
}

/// `lock:<productId>` or `lock:catalog-import`
#[must_use]
pub fn lock_key(resource: &Resource) -> String {
    format!("{LOCK_PREFIX}{resource}")
}

/// Parse the product id out of a `reservation-index:<productId>` key.
#[must_use]
pub fn product_from_index_key(key: &str) -> Option<ProductId> {
    key.strip_prefix(RESERVATION_INDEX_PREFIX)?.parse().ok()
}

/// Parse `(user, product)` out of a `reservation:<userId>:<productId>` key.
#[must_use]
pub fn parse_reservation_key(key: &str) -> Option<(UserId, ProductId)> {
    let rest = key.strip_prefix(RESERVATION_PREFIX)?;
    let (user, product) = rest.split_once(':')?;
    Some((user.parse().ok()?, product.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_key_parses_back() {
        let user = UserId::new();
        let product = ProductId::new();
        let key = reservation_key(&user, &product);

        assert_eq!(parse_reservation_key(&key), Some((user, product)));
        assert_eq!(parse_reservation_key("stock:abc"), None);
    }

    #[test]
    fn index_namespace_does_not_overlap_records() {
        let product = ProductId::new();
        let index = reservation_index_key(&product);

        assert!(!index.starts_with(RESERVATION_PREFIX));
        assert_eq!(product_from_index_key(&index), Some(product));
    }

    #[test]
    fn lock_keys() {
        let product = ProductId::new();
        assert_eq!(
            lock_key(&Resource::Product(product)),
            format!("lock:{product}")
        );
        assert_eq!(lock_key(&Resource::CatalogImport), "lock:catalog-import");
    }
}
