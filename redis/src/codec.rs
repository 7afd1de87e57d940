//! Decoding of script replies and reservation hashes.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use stockline_core::store::{
    ConfirmOutcome, FinalizeOutcome, HoldOutcome, HoldRequest, HoldResult,
};
use stockline_core::{ProductId, Reservation, ReservationStatus, Result, StockError, UserId};

/// Unix milliseconds to a timestamp.
pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StockError::Store(format!("Invalid timestamp: {ms}")))
}

fn parse_i64(field: &str, value: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|e| StockError::Store(format!("Invalid {field} {value:?}: {e}")))
}

fn quantity(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| StockError::Store(format!("Invalid quantity: {value}")))
}

fn optional_millis(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value {
        None | Some("") => Ok(None),
        Some(ms) => from_millis(parse_i64("finalized_at", ms)?).map(Some),
    }
}

/// Decode a reservation hash read with `HGETALL`. An empty hash is a missing record.
pub(crate) fn decode_record(fields: &HashMap<String, String>) -> Result<Option<Reservation>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let get = |name: &str| {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| StockError::Store(format!("Reservation record is missing {name}")))
    };

    let user_id: UserId = get("user")?
        .parse()
        .map_err(|e| StockError::Store(format!("Invalid user id: {e}")))?;
    let product_id: ProductId = get("product")?
        .parse()
        .map_err(|e| StockError::Store(format!("Invalid product id: {e}")))?;

    Ok(Some(Reservation {
        user_id,
        product_id,
        quantity: quantity(parse_i64("quantity", get("quantity")?)?)?,
        status: ReservationStatus::parse(get("status")?)?,
        created_at: from_millis(parse_i64("created_at", get("created_at")?)?)?,
        expires_at: from_millis(parse_i64("expires_at", get("expires_at")?)?)?,
        finalized_at: optional_millis(fields.get("finalized_at").map(String::as_str))?,
    }))
}

/// Decode the reply of the place-hold script.
pub(crate) fn decode_hold(request: &HoldRequest, reply: &[i64]) -> Result<HoldOutcome> {
    let &[
        code,
        value,
        held_quantity,
        held_created,
        held_expires,
        reclaimed,
        reclaimed_quantity,
        reclaimed_created,
        reclaimed_expires,
    ] = reply
    else {
        return Err(StockError::Store(format!(
            "Unexpected place-hold reply of {} values",
            reply.len()
        )));
    };

    let reclaimed = if reclaimed == 1 {
        Some(Reservation {
            user_id: request.user_id,
            product_id: request.product_id,
            quantity: quantity(reclaimed_quantity)?,
            status: ReservationStatus::RolledBack,
            created_at: from_millis(reclaimed_created)?,
            expires_at: from_millis(reclaimed_expires)?,
            finalized_at: Some(request.now),
        })
    } else {
        None
    };

    let result = match code {
        0 => HoldResult::Reserved {
            reservation: Reservation::pending(
                request.user_id,
                request.product_id,
                request.quantity,
                request.now,
                request.expires_at,
            ),
            remaining: value,
        },
        1 => HoldResult::Insufficient { available: value },
        2 => HoldResult::AlreadyPending(Reservation::pending(
            request.user_id,
            request.product_id,
            quantity(held_quantity)?,
            from_millis(held_created)?,
            from_millis(held_expires)?,
        )),
        3 => HoldResult::CounterMissing,
        other => {
            return Err(StockError::Store(format!(
                "Unexpected place-hold code: {other}"
            )));
        },
    };

    Ok(HoldOutcome { result, reclaimed })
}

/// Decode the reply of the confirm and release scripts.
pub(crate) fn decode_finalize(
    user_id: UserId,
    product_id: ProductId,
    reply: &[String],
) -> Result<FinalizeOutcome> {
    let field = |index: usize| {
        reply
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| StockError::Store(format!("Finalize reply is missing field {index}")))
    };

    let outcome = field(0)?;
    if outcome == "missing" {
        return Ok(FinalizeOutcome::NotFound);
    }

    let reservation = Reservation {
        user_id,
        product_id,
        quantity: quantity(parse_i64("quantity", field(2)?)?)?,
        status: ReservationStatus::parse(field(1)?)?,
        created_at: from_millis(parse_i64("created_at", field(3)?)?)?,
        expires_at: from_millis(parse_i64("expires_at", field(4)?)?)?,
        finalized_at: optional_millis(Some(field(5)?))?,
    };

    match outcome {
        "final" => Ok(FinalizeOutcome::AlreadyFinal(reservation)),
        "live" => Ok(FinalizeOutcome::NotExpired(reservation)),
        "finalized" => {
            let counter = match field(6)? {
                "" => None,
                value => Some(parse_i64("counter", value)?),
            };
            Ok(FinalizeOutcome::Finalized {
                reservation,
                counter,
            })
        },
        other => Err(StockError::Store(format!(
            "Unexpected finalize outcome: {other}"
        ))),
    }
}

/// Decode the reply of the confirm script, which never checks expiry.
pub(crate) fn decode_confirm(
    user_id: UserId,
    product_id: ProductId,
    reply: &[String],
) -> Result<ConfirmOutcome> {
    match decode_finalize(user_id, product_id, reply)? {
        FinalizeOutcome::Finalized { reservation, .. } => {
            Ok(ConfirmOutcome::Confirmed(reservation))
        },
        FinalizeOutcome::NotFound => Ok(ConfirmOutcome::NotFound),
        FinalizeOutcome::AlreadyFinal(reservation) => {
            Ok(ConfirmOutcome::AlreadyFinal(reservation))
        },
        FinalizeOutcome::NotExpired(_) => Err(StockError::Store(
            "Unexpected 'live' reply to a confirmation".to_string(),
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request() -> HoldRequest {
        let now = from_millis(1_700_000_000_000).unwrap();
        HoldRequest {
            user_id: UserId::new(),
            product_id: ProductId::new(),
            quantity: 3,
            now,
            expires_at: now + chrono::Duration::minutes(15),
            retention: Duration::from_secs(86_400),
        }
    }

    #[test]
    fn reserved_reply_with_reclaim() {
        let request = request();
        let reply = [0, 7, 0, 0, 0, 1, 2, 1_699_000_000_000, 1_699_000_900_000];

        let outcome = decode_hold(&request, &reply).unwrap();

        assert!(matches!(outcome.result, HoldResult::Reserved { remaining: 7, .. }));
        let reclaimed = outcome.reclaimed.unwrap();
        assert_eq!(reclaimed.quantity, 2);
        assert_eq!(reclaimed.status, ReservationStatus::RolledBack);
    }

    #[test]
    fn short_hold_reply_is_rejected() {
        assert!(decode_hold(&request(), &[0, 1]).is_err());
    }

    #[test]
    fn record_hash_decodes() {
        let user = UserId::new();
        let product = ProductId::new();
        let fields: HashMap<String, String> = [
            ("user", user.to_string()),
            ("product", product.to_string()),
            ("quantity", "4".to_string()),
            ("status", "confirmed".to_string()),
            ("created_at", "1700000000000".to_string()),
            ("expires_at", "1700000900000".to_string()),
            ("finalized_at", "1700000100000".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let record = decode_record(&fields).unwrap().unwrap();

        assert_eq!(record.user_id, user);
        assert_eq!(record.product_id, product);
        assert_eq!(record.quantity, 4);
        assert_eq!(record.status, ReservationStatus::Confirmed);
        assert_eq!(record.finalized_at, Some(from_millis(1_700_000_100_000).unwrap()));
        assert_eq!(decode_record(&HashMap::new()).unwrap(), None);
    }

    #[test]
    fn finalize_replies() {
        let (user, product) = (UserId::new(), ProductId::new());
        let reply = |values: &[&str]| values.iter().map(ToString::to_string).collect::<Vec<_>>();

        assert_eq!(
            decode_finalize(user, product, &reply(&["missing"])).unwrap(),
            FinalizeOutcome::NotFound
        );

        let released = decode_finalize(
            user,
            product,
            &reply(&[
                "finalized",
                "rolled_back",
                "5",
                "1700000000000",
                "1700000900000",
                "1700000950000",
                "12",
            ]),
        )
        .unwrap();
        match released {
            FinalizeOutcome::Finalized {
                reservation,
                counter,
            } => {
                assert_eq!(reservation.quantity, 5);
                assert_eq!(reservation.status, ReservationStatus::RolledBack);
                assert_eq!(counter, Some(12));
            },
            other => panic!("unexpected outcome {other:?}"),
        }

        let live = decode_finalize(
            user,
            product,
            &reply(&["live", "pending", "1", "1700000000000", "1700000900000", "", ""]),
        )
        .unwrap();
        assert!(matches!(live, FinalizeOutcome::NotExpired(r) if r.finalized_at.is_none()));
    }

    #[test]
    fn confirm_replies() {
        let (user, product) = (UserId::new(), ProductId::new());
        let reply = |values: &[&str]| values.iter().map(ToString::to_string).collect::<Vec<_>>();

        let confirmed = decode_confirm(
            user,
            product,
            &reply(&[
                "finalized",
                "confirmed",
                "2",
                "1700000000000",
                "1700000900000",
                "1700000100000",
                "",
            ]),
        )
        .unwrap();
        assert!(matches!(
            confirmed,
            ConfirmOutcome::Confirmed(r) if r.status == ReservationStatus::Confirmed
        ));

        let live = decode_confirm(
            user,
            product,
            &reply(&["live", "pending", "1", "1700000000000", "1700000900000", "", ""]),
        );
        assert!(matches!(live, Err(StockError::Store(_))));
    }
}
