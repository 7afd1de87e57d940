//! Lua scripts executed atomically by Redis.
//!
//! Scripts receive the current time from the caller (`ARGV`), never from the
//! server clock, so expiry decisions follow the engine's clock.
//!
//! Reservation records are hashes with the fields `user`, `product`,
//! `quantity`, `status`, `created_at`, `expires_at` and `finalized_at`
//! (timestamps in Unix milliseconds).

use redis::Script;

/// Sums the pending units of a product, pruning index entries whose record
/// has expired. Prepended to the scripts that derive a counter.
const PENDING_TOTAL: &str = r"
local function pending_total(index_key, prefix, product)
  local total = 0
  for _, user in ipairs(redis.call('SMEMBERS', index_key)) do
    local record = redis.call('HMGET', prefix .. user .. ':' .. product, 'status', 'quantity')
    if not record[1] then
      redis.call('SREM', index_key, user)
    elseif record[1] == 'pending' then
      total = total + tonumber(record[2])
    end
  end
  return total
end
";

/// True when the settlement epoch still equals `epoch` and no confirmation
/// lease is live at `now`. Lapsed leases are pruned.
///
/// The settlement hash holds the field `epoch` plus one field per in-flight
/// confirmation (user id → lease deadline in ms).
const SETTLED: &str = r"
local function settled(settlement_key, epoch, now)
  local fields = redis.call('HGETALL', settlement_key)
  local current = 0
  local live = false
  for i = 1, #fields, 2 do
    local name, value = fields[i], tonumber(fields[i + 1])
    if name == 'epoch' then
      current = value
    elseif value > now then
      live = true
    else
      redis.call('HDEL', settlement_key, name)
    end
  end
  return current == epoch and not live
end
";

/// KEYS: stock, index, settlement.
/// ARGV: ledger stock, ttl ms, reservation prefix, product, epoch, now ms.
/// Returns `{code, value}` with code 1 seeded, 0 present, 2 settling.
const SEED: &str = r"
local current = redis.call('GET', KEYS[1])
if current then
  return {0, tonumber(current)}
end
if not settled(KEYS[3], tonumber(ARGV[5]), tonumber(ARGV[6])) then
  return {2, 0}
end
local value = tonumber(ARGV[1]) - pending_total(KEYS[2], ARGV[3], ARGV[4])
redis.call('SET', KEYS[1], value, 'PX', ARGV[2])
return {1, value}
";

/// Same keys and arguments as `SEED`.
/// Returns `{code, value}` with code 1 published, 2 settling.
const PUBLISH: &str = r"
if not settled(KEYS[3], tonumber(ARGV[5]), tonumber(ARGV[6])) then
  return {2, 0}
end
local value = tonumber(ARGV[1]) - pending_total(KEYS[2], ARGV[3], ARGV[4])
redis.call('SET', KEYS[1], value, 'PX', ARGV[2])
return {1, value}
";

/// KEYS: stock, reservation, index.
/// ARGV: user, product, quantity, now ms, expires ms, retention ms.
///
/// Returns nine integers:
/// `{code, value, held quantity, held created, held expires,
///   reclaimed (0|1), reclaimed quantity, reclaimed created, reclaimed expires}`
/// where code is 0 reserved (value = remaining), 1 insufficient
/// (value = available), 2 already pending, 3 counter missing.
const PLACE_HOLD: &str = r"
local quantity = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local reclaimed = {0, 0, 0, 0}

local held = redis.call('HMGET', KEYS[2], 'status', 'quantity', 'created_at', 'expires_at')
if held[1] == 'pending' then
  local held_quantity = tonumber(held[2])
  local held_expires = tonumber(held[4])
  if held_expires > now then
    return {2, 0, held_quantity, tonumber(held[3]), held_expires, 0, 0, 0, 0}
  end
  if redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('INCRBY', KEYS[1], held_quantity)
  end
  redis.call('HSET', KEYS[2], 'status', 'rolled_back', 'finalized_at', ARGV[4])
  redis.call('PEXPIRE', KEYS[2], ARGV[6])
  reclaimed = {1, held_quantity, tonumber(held[3]), held_expires}
end

local current = redis.call('GET', KEYS[1])
if not current then
  return {3, 0, 0, 0, 0, reclaimed[1], reclaimed[2], reclaimed[3], reclaimed[4]}
end
current = tonumber(current)
if current < quantity then
  return {1, current, 0, 0, 0, reclaimed[1], reclaimed[2], reclaimed[3], reclaimed[4]}
end

local remaining = redis.call('DECRBY', KEYS[1], quantity)
redis.call('DEL', KEYS[2])
redis.call('HSET', KEYS[2],
  'user', ARGV[1], 'product', ARGV[2], 'quantity', ARGV[3], 'status', 'pending',
  'created_at', ARGV[4], 'expires_at', ARGV[5])
local keep_until = tonumber(ARGV[5]) + tonumber(ARGV[6])
redis.call('PEXPIREAT', KEYS[2], keep_until)

redis.call('SADD', KEYS[3], ARGV[1])
if redis.call('PTTL', KEYS[3]) < keep_until - now then
  redis.call('PEXPIREAT', KEYS[3], keep_until)
end
return {0, remaining, 0, 0, 0, reclaimed[1], reclaimed[2], reclaimed[3], reclaimed[4]}
";

/// Shared head of the two finalizing scripts. Reads the record of `KEYS[1]`
/// and answers `{'missing'}` or `{'final', ...}` when there is nothing to do.
///
/// Replies are string arrays:
/// `{outcome, status, quantity, created_at, expires_at, finalized_at, counter}`.
const FINALIZE_HEAD: &str = r"
local record = redis.call('HMGET', KEYS[1], 'status', 'quantity', 'created_at', 'expires_at', 'finalized_at')
if not record[1] then
  return {'missing'}
end
local function snapshot(outcome, status, finalized_at, counter)
  return {outcome, status, record[2], record[3], record[4], finalized_at or '', counter or ''}
end
if record[1] ~= 'pending' then
  return snapshot('final', record[1], record[5])
end
";

/// KEYS: reservation. ARGV: now ms, retention ms.
const MARK_CONFIRMED: &str = r"
redis.call('HSET', KEYS[1], 'status', 'confirmed', 'finalized_at', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return snapshot('finalized', 'confirmed', ARGV[1])
";

/// KEYS: reservation, stock. ARGV: now ms, retention ms, mode
/// (`always` | `if_expired`).
const RELEASE_HOLD: &str = r"
if ARGV[3] == 'if_expired' and tonumber(record[4]) > tonumber(ARGV[1]) then
  return snapshot('live', 'pending')
end
local counter = ''
if redis.call('EXISTS', KEYS[2]) == 1 then
  counter = tostring(redis.call('INCRBY', KEYS[2], record[2]))
end
redis.call('HSET', KEYS[1], 'status', 'rolled_back', 'finalized_at', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return snapshot('finalized', 'rolled_back', ARGV[1], counter)
";

/// KEYS: lock. ARGV: token. Returns 1 released, 0 not owner, -1 not held.
const UNLOCK: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
if current == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
";

/// Compiled scripts, hashed once per store.
pub(crate) struct Scripts {
    pub(crate) seed: Script,
    pub(crate) publish: Script,
    pub(crate) place_hold: Script,
    pub(crate) mark_confirmed: Script,
    pub(crate) release_hold: Script,
    pub(crate) unlock: Script,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Self {
            seed: Script::new(&format!("{PENDING_TOTAL}{SETTLED}{SEED}")),
            publish: Script::new(&format!("{PENDING_TOTAL}{SETTLED}{PUBLISH}")),
            place_hold: Script::new(PLACE_HOLD),
            mark_confirmed: Script::new(&format!("{FINALIZE_HEAD}{MARK_CONFIRMED}")),
            release_hold: Script::new(&format!("{FINALIZE_HEAD}{RELEASE_HOLD}")),
            unlock: Script::new(UNLOCK),
        }
    }
}
