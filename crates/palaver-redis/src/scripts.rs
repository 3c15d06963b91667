// Server-side scripts for writes that mix a conditional with a mutation.
// Plain MULTI/EXEC covers unconditional multi-key writes; these scripts exist
// for the one conditional the data model depends on: set a TTL only when the
// key has none, so a hot key is neither immortalized nor re-aged.
use redis::Script;
use std::sync::LazyLock;

// TTL returns -1 for "exists, no expiry" and -2 for "missing"; both mean the
// freshly written key needs its expiry applied.

/// Subscribe: link the four subscription keys and apply subscription_ttl to
/// each only if absent.
///
/// KEYS: subscriptions:{cid}, channels:{ch}, subscription:{cid}:{ch}, patterns
/// ARGV: channel, client_id, subscription_ttl, now_epoch_secs, is_pattern
pub static SUBSCRIBE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        redis.call('SADD', KEYS[1], ARGV[1])
        redis.call('SADD', KEYS[2], ARGV[2])
        redis.call('HSET', KEYS[3],
            'subscribed_at', ARGV[4], 'channel', ARGV[1], 'client_id', ARGV[2])
        local touched = { KEYS[1], KEYS[2], KEYS[3] }
        if ARGV[5] == '1' then
            redis.call('SADD', KEYS[4], ARGV[1])
            touched[#touched + 1] = KEYS[4]
        end
        for _, key in ipairs(touched) do
            if redis.call('TTL', key) < 0 then
                redis.call('EXPIRE', key, ARGV[3])
            end
        end
        return 1
        "#,
    )
});

/// Unsubscribe: unlink both set memberships and the per-subscription hash;
/// retire the pattern when its subscriber set emptied. Returns 1 when the
/// pattern was retired so the caller can evict its compiled regex.
///
/// KEYS: subscriptions:{cid}, channels:{ch}, subscription:{cid}:{ch}, patterns
/// ARGV: channel, client_id, is_pattern
pub static UNSUBSCRIBE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        redis.call('SREM', KEYS[1], ARGV[1])
        redis.call('SREM', KEYS[2], ARGV[2])
        redis.call('DEL', KEYS[3])
        if ARGV[3] == '1' and redis.call('SCARD', KEYS[2]) == 0 then
            redis.call('SREM', KEYS[4], ARGV[1])
            return 1
        end
        return 0
        "#,
    )
});

/// Enqueue one encoded message, applying message_ttl only to a queue that has
/// no expiry yet (the first message into an empty queue starts the clock).
///
/// KEYS: messages:{cid}
/// ARGV: payload, message_ttl
pub static ENQUEUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        redis.call('RPUSH', KEYS[1], ARGV[1])
        if redis.call('TTL', KEYS[1]) < 0 then
            redis.call('EXPIRE', KEYS[1], ARGV[2])
        end
        return redis.call('LLEN', KEYS[1])
        "#,
    )
});

/// Fan one encoded message out to every recipient queue in a single atomic
/// step, with the same TTL-if-absent rule per queue.
///
/// KEYS: messages:{cid} per recipient
/// ARGV: payload, message_ttl
pub static ENQUEUE_BATCH: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        for i = 1, #KEYS do
            redis.call('RPUSH', KEYS[i], ARGV[1])
            if redis.call('TTL', KEYS[i]) < 0 then
                redis.call('EXPIRE', KEYS[i], ARGV[2])
            end
        end
        return #KEYS
        "#,
    )
});
