//! Atomic transition scripts.
//!
//! Every transition that touches two or more keys runs as one server-side
//! script and returns a small integer discriminator so the caller can branch
//! without a second round-trip. Task and lease keys are derived from the id
//! inside the script; queue collection keys are passed as KEYS.

use redis::Script;

/// KEYS: [task, destination, ttl-index, idem]
/// ARGV: [id, has_idem, idem_ttl, visible_at, ttl_expire_at, field, value, ...]
///
/// Returns {0, existing_id} when the idempotency record already exists,
/// {1, id} when the task was enqueued. `visible_at > 0` selects the delayed
/// index, otherwise the pending list.
const ENQUEUE: &str = r#"
if ARGV[2] == '1' then
    local claimed = redis.call('SET', KEYS[4], ARGV[1], 'NX', 'EX', tonumber(ARGV[3]))
    if not claimed then
        return {0, redis.call('GET', KEYS[4])}
    end
end
for i = 6, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
if tonumber(ARGV[4]) > 0 then
    redis.call('ZADD', KEYS[2], tonumber(ARGV[4]), ARGV[1])
else
    redis.call('RPUSH', KEYS[2], ARGV[1])
end
redis.call('ZADD', KEYS[3], tonumber(ARGV[5]), ARGV[1])
return {1, ARGV[1]}
"#;

/// KEYS: [pending, inprog]
/// ARGV: [worker_id, now, lease_until]
///
/// Returns {0} when the list is empty, {2, id} when the popped id has no
/// task hash (nothing is mutated), {1, id, attempts} on a successful claim.
const CLAIM_POP: &str = r#"
local id = redis.call('LPOP', KEYS[1])
if not id then
    return {0}
end
local task = 'task:' .. id
if redis.call('EXISTS', task) == 0 then
    redis.call('DEL', 'lease:' .. id)
    return {2, id}
end
redis.call('SADD', KEYS[2], id)
local attempts = redis.call('HINCRBY', task, 'attempts', 1)
redis.call('HSET', task,
    'status', 'IN_PROGRESS',
    'worker_id', ARGV[1],
    'lease_until', ARGV[3],
    'updated_at', ARGV[2])
redis.call('SET', 'lease:' .. id, ARGV[1] .. '|' .. ARGV[3])
return {1, id, attempts}
"#;

/// KEYS: [inprog]; ARGV: [id]
///
/// Drops the in-progress membership and lease left behind by a claim whose
/// id turned out to be a ghost.
const PURGE_RESIDUALS: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('DEL', 'lease:' .. ARGV[1])
return 1
"#;

/// KEYS: [inprog, dlq]
/// ARGV: [id, now, default_max_attempts, pending_prefix]
///
/// Claim-time lease repair for one in-progress member. Returns {0} when the
/// lease is still held, {1} re-queued to pending, {2} dead-lettered, {3}
/// the hash was gone (membership dropped only).
const REQUEUE_EXPIRED: &str = r#"
local lease = redis.call('GET', 'lease:' .. ARGV[1])
if lease then
    local sep = string.find(lease, '|', 1, true)
    local held_until = sep and tonumber(string.sub(lease, sep + 1))
    if held_until and held_until >= tonumber(ARGV[2]) then
        return {0}
    end
end
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('DEL', 'lease:' .. ARGV[1])
local task = 'task:' .. ARGV[1]
if redis.call('EXISTS', task) == 0 then
    return {3}
end
local attempts = tonumber(redis.call('HGET', task, 'attempts') or '0')
local max_attempts = tonumber(redis.call('HGET', task, 'max_attempts') or '0')
if max_attempts <= 0 then
    max_attempts = tonumber(ARGV[3])
end
if attempts >= max_attempts then
    redis.call('SADD', KEYS[2], ARGV[1])
    redis.call('HSET', task,
        'status', 'FAILED',
        'error', 'lease expired',
        'worker_id', '',
        'lease_until', '',
        'updated_at', ARGV[2])
    return {2}
end
local priority = redis.call('HGET', task, 'priority') or '0'
redis.call('RPUSH', ARGV[4] .. priority, ARGV[1])
redis.call('HSET', task,
    'status', 'PENDING',
    'worker_id', '',
    'lease_until', '',
    'updated_at', ARGV[2])
return {1}
"#;

/// KEYS: [lease, task]; ARGV: [worker_id, now, lease_until]
///
/// Returns {-1} no lease, {0} owned by another worker, {1} extended.
const HEARTBEAT: &str = r#"
local lease = redis.call('GET', KEYS[1])
if not lease then
    return {-1}
end
local sep = string.find(lease, '|', 1, true)
if string.sub(lease, 1, sep - 1) ~= ARGV[1] then
    return {0}
end
redis.call('SET', KEYS[1], ARGV[1] .. '|' .. ARGV[3])
redis.call('HSET', KEYS[2], 'lease_until', ARGV[3], 'updated_at', ARGV[2])
return {1}
"#;

/// KEYS: [lease, task, inprog, dlq, delayed]
/// ARGV: [worker_id, now, delay_seconds, default_max_attempts, reason,
///        pending_prefix, id]
///
/// Returns {-1} no lease, {0} not owner, {2, 0} dead-lettered,
/// {1, delay} re-queued (delayed index when delay > 0, else pending).
const NACK: &str = r#"
local lease = redis.call('GET', KEYS[1])
if not lease then
    return {-1}
end
local sep = string.find(lease, '|', 1, true)
if string.sub(lease, 1, sep - 1) ~= ARGV[1] then
    return {0}
end
redis.call('SREM', KEYS[3], ARGV[7])
redis.call('DEL', KEYS[1])
local attempts = tonumber(redis.call('HGET', KEYS[2], 'attempts') or '0')
local max_attempts = tonumber(redis.call('HGET', KEYS[2], 'max_attempts') or '0')
if max_attempts <= 0 then
    max_attempts = tonumber(ARGV[4])
end
if attempts >= max_attempts then
    redis.call('SADD', KEYS[4], ARGV[7])
    redis.call('HSET', KEYS[2],
        'status', 'FAILED',
        'error', ARGV[5],
        'worker_id', '',
        'lease_until', '',
        'updated_at', ARGV[2])
    return {2, 0}
end
local delay = tonumber(ARGV[3])
if delay > 0 then
    redis.call('ZADD', KEYS[5], tonumber(ARGV[2]) + delay, ARGV[7])
else
    local priority = redis.call('HGET', KEYS[2], 'priority') or '0'
    redis.call('RPUSH', ARGV[6] .. priority, ARGV[7])
end
redis.call('HSET', KEYS[2],
    'status', 'PENDING',
    'worker_id', '',
    'lease_until', '',
    'updated_at', ARGV[2])
return {1, delay}
"#;

/// KEYS: [lease, task, inprog, result]
/// ARGV: [worker_id, now, id, status, error, record_json, result_key]
///
/// Returns {-2} task missing, {-3} not in progress, {-1} no lease,
/// {0} not owner, {1} stored. The status check runs before the owner check
/// so a second submission on a terminal task reports not-in-progress.
const STORE_RESULT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 0 then
    return {-2}
end
if redis.call('HGET', KEYS[2], 'status') ~= 'IN_PROGRESS' then
    return {-3}
end
local lease = redis.call('GET', KEYS[1])
if not lease then
    return {-1}
end
local sep = string.find(lease, '|', 1, true)
if string.sub(lease, 1, sep - 1) ~= ARGV[1] then
    return {0}
end
redis.call('SET', KEYS[4], ARGV[6])
redis.call('SREM', KEYS[3], ARGV[3])
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[2],
    'status', ARGV[4],
    'error', ARGV[5],
    'result_key', ARGV[7],
    'worker_id', '',
    'lease_until', '',
    'updated_at', ARGV[2])
return {1}
"#;

/// KEYS: [delayed]; ARGV: [id, pending_prefix]
///
/// Promote one due id. The HEXISTS guard suppresses resurrection of a task
/// deleted mid-delay. Returns 0 already gone from the index, 1 promoted,
/// 2 dropped (hash missing).
const PROMOTE_ONE: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
local task = 'task:' .. ARGV[1]
if redis.call('EXISTS', task) == 0 then
    return 2
end
local priority = redis.call('HGET', task, 'priority') or '0'
redis.call('RPUSH', ARGV[2] .. priority, ARGV[1])
return 1
"#;

/// KEYS: [ttl-index]; ARGV: [id]
///
/// Admin cleanup for one expired id: drop it from the ttl-index, from every
/// queue collection its hash still names, and delete hash and lease.
const CLEANUP_TASK: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
local task = 'task:' .. ARGV[1]
local command = redis.call('HGET', task, 'command')
if command then
    local tenant = redis.call('HGET', task, 'tenant_id')
    local base = 'q:' .. command .. ':'
    if tenant and tenant ~= '' then
        base = base .. tenant .. ':'
    end
    local priority = redis.call('HGET', task, 'priority') or '0'
    redis.call('LREM', base .. 'pending:' .. priority, 0, ARGV[1])
    redis.call('ZREM', base .. 'delayed', ARGV[1])
    redis.call('SREM', base .. 'inprog', ARGV[1])
    redis.call('SREM', base .. 'dlq', ARGV[1])
end
redis.call('DEL', task)
redis.call('DEL', 'lease:' .. ARGV[1])
return 1
"#;

pub struct ScriptSet {
    pub enqueue: Script,
    pub claim_pop: Script,
    pub purge_residuals: Script,
    pub requeue_expired: Script,
    pub heartbeat: Script,
    pub nack: Script,
    pub store_result: Script,
    pub promote_one: Script,
    pub cleanup_task: Script,
}

impl ScriptSet {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            claim_pop: Script::new(CLAIM_POP),
            purge_residuals: Script::new(PURGE_RESIDUALS),
            requeue_expired: Script::new(REQUEUE_EXPIRED),
            heartbeat: Script::new(HEARTBEAT),
            nack: Script::new(NACK),
            store_result: Script::new(STORE_RESULT),
            promote_one: Script::new(PROMOTE_ONE),
            cleanup_task: Script::new(CLEANUP_TASK),
        }
    }
}

impl Default for ScriptSet {
    fn default() -> Self {
        Self::new()
    }
}
