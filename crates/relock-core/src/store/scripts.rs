//! Canonical protocol scripts for Redis-compatible stores
//!
//! Both scripts run as single atomic server-side steps. Adapters map their
//! raw replies through [`AcquireReply::from_raw`] and
//! [`ReleaseOutcome::from_raw`](super::ReleaseOutcome::from_raw).
//!
//! [`AcquireReply::from_raw`]: super::AcquireReply::from_raw

/// Atomic acquire.
///
/// `KEYS[1]` = lock key, `ARGV[1]` = lease in milliseconds, `ARGV[2]` =
/// owner token.
///
/// Creates the record with hold count 1 and the lease when the key is
/// absent, increments the hold count (without refreshing the lease) when
/// the caller already owns it, both replying `nil`. Otherwise replies the
/// key's remaining lease in milliseconds, clamped to at least 1 so a reply
/// of `0` is never ambiguous with success. A key that exists without a
/// lease yields a negative reply, which the client treats as a protocol
/// violation rather than a lock outcome.
pub const ACQUIRE: &str = r#"
if (redis.call('exists', KEYS[1]) == 0) then
  redis.call('hincrby', KEYS[1], ARGV[2], 1);
  redis.call('pexpire', KEYS[1], ARGV[1]);
  return nil;
end;
if (redis.call('hexists', KEYS[1], ARGV[2]) == 1) then
  redis.call('hincrby', KEYS[1], ARGV[2], 1);
  return nil;
end;
local ttl = redis.call('pttl', KEYS[1]);
if (ttl == 0) then
  return 1;
end;
return ttl;
"#;

/// Atomic release.
///
/// `KEYS[1]` = lock key, `ARGV[1]` = owner token.
///
/// Replies `nil` when the owner holds no entry, `0` when the hold count was
/// decremented but remains positive, `1` when the record was deleted. No
/// publish happens here; the manager publishes after the store confirms the
/// full release, so subscribers never observe a notification for a key that
/// still exists.
pub const RELEASE: &str = r#"
if (redis.call('hexists', KEYS[1], ARGV[1]) == 0) then
  return nil;
end;
local counter = redis.call('hincrby', KEYS[1], ARGV[1], -1);
if (counter > 0) then
  return 0;
end;
redis.call('del', KEYS[1]);
return 1;
"#;
