//! Domain types for the stock consistency engine.
//!
//! Value objects for the three pieces of shared state: the per-product
//! [`StockCounter`], the per-(user, product) [`Reservation`], and the
//! distributed lock identified by a [`Resource`] and owned through a [`LockToken`].

use crate::error::StockError;
use crate::keys;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a catalog product
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(Uuid);

impl ProductId {
    /// Creates a new random `ProductId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ProductId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProductId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProductId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for a shopper (or admin) issuing requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random `UserId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `UserId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ============================================================================
// Stock counter
// ============================================================================

/// Where the value of a [`StockCounter`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterSource {
    /// Value was already present in the shared cache
    Cache,
    /// Value was just rebuilt from the durable ledger
    Resynced,
}

/// Available-stock counter for one product as held by the shared cache.
///
/// `quantity` is signed: an admin may lower the ledger below the units
/// currently held by pending reservations, in which case the counter goes
/// negative until those reservations resolve. Reservations themselves never
/// drive it below zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCounter {
    /// Product this counter belongs to
    pub product_id: ProductId,
    /// Units available for new reservations
    pub quantity: i64,
    /// Origin of the value
    pub source: CounterSource,
}

impl StockCounter {
    /// Counter read straight from the cache.
    #[must_use]
    pub const fn cached(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
            source: CounterSource::Cache,
        }
    }

    /// Counter rebuilt from the ledger.
    #[must_use]
    pub const fn resynced(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
            source: CounterSource::Resynced,
        }
    }

    /// Units that can actually be reserved (never negative).
    #[must_use]
    pub fn sellable(&self) -> i64 {
        self.quantity.max(0)
    }
}

// ============================================================================
// Reservations
// ============================================================================

/// Lifecycle status of a [`Reservation`].
///
/// `Pending` transitions exactly once, to either `Confirmed` or `RolledBack`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Units are held, awaiting order outcome
    Pending,
    /// Order committed; units consumed from the ledger
    Confirmed,
    /// Order failed or hold expired; units returned to the counter
    RolledBack,
}

impl ReservationStatus {
    /// Convert status to its stored string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Parse status from its stored string representation.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StockError> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(StockError::Store(format!("Invalid reservation status: {s}"))),
        }
    }

    /// Returns `true` for `Confirmed` and `RolledBack`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A temporary hold of stock by one user on one product.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Holder
    pub user_id: UserId,
    /// Held product
    pub product_id: ProductId,
    /// Units held (always positive)
    pub quantity: u32,
    /// Current status
    pub status: ReservationStatus,
    /// When the hold was taken
    pub created_at: DateTime<Utc>,
    /// When an unconfirmed hold is considered abandoned
    pub expires_at: DateTime<Utc>,
    /// When the reservation reached its terminal status
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Create a new pending reservation.
    #[must_use]
    pub const fn pending(
        user_id: UserId,
        product_id: ProductId,
        quantity: u32,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            product_id,
            quantity,
            status: ReservationStatus::Pending,
            created_at,
            expires_at,
            finalized_at: None,
        }
    }

    /// Returns `true` while the reservation still holds units.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.status, ReservationStatus::Pending)
    }

    /// A pending reservation whose hold has lapsed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_at <= now
    }

    /// Cache key of this reservation record.
    #[must_use]
    pub fn key(&self) -> String {
        keys::reservation_key(&self.user_id, &self.product_id)
    }
}

// ============================================================================
// Locks
// ============================================================================

/// A lockable resource in the shared store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    /// Per-product lock guarding stock mutations
    Product(ProductId),
    /// Single global lock held for the duration of a bulk catalog import
    CatalogImport,
}

impl Resource {
    /// Store key of the lock for this resource.
    #[must_use]
    pub fn key(&self) -> String {
        keys::lock_key(self)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Product(id) => write!(f, "{id}"),
            Self::CatalogImport => f.write_str(keys::CATALOG_IMPORT_RESOURCE),
        }
    }
}

/// Opaque owner token of a distributed lock.
///
/// Only the holder of the token can release the lock it was issued for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Generate a fresh random token
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
