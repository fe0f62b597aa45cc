/// Lua script for sliding window admission
///
/// Prunes, counts and inserts in one atomic step, using the Redis server's
/// own clock so that gateway instances with skewed clocks agree.
///
/// KEYS[1] = the window key
/// ARGV[1] = window length (milliseconds)
/// ARGV[2] = capacity (limit + burst)
/// ARGV[3] = unique member for the new entry
///
/// Returns: [admitted (0/1), count in window, oldest entry ms (-1 if none), now ms]
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
redis.replicate_commands()

local key = KEYS[1]
local window = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local member = ARGV[3]

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

-- Entries at or before the window start are expired
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

local count = redis.call('ZCARD', key)
local admitted = 0

if count < capacity then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window)
    admitted = 1
    count = count + 1
end

local oldest_ms = -1
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    oldest_ms = tonumber(oldest[2])
end

return {admitted, count, oldest_ms, now}
"#;

/// Lua script for compare-and-set on a string key
///
/// KEYS[1] = the key
/// ARGV[1] = expected value
/// ARGV[2] = '1' if an expected value is given, '0' if the key must be absent
/// ARGV[3] = new value
/// ARGV[4] = ttl in milliseconds (0 = no expiry)
///
/// Returns: 1 if written, 0 otherwise
pub const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local matches = false

if ARGV[2] == '1' then
    matches = (current == ARGV[1])
else
    matches = (current == false)
end

if not matches then
    return 0
end

local ttl = tonumber(ARGV[4])
if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
    redis.call('SET', KEYS[1], ARGV[3])
end

return 1
"#;

/// Lua script for a conditional multi-hash write
///
/// KEYS = every hash touched, referenced below by 1-based index
/// ARGV[1] = number of conditions, then per condition:
///   kind ('eq' | 'absent' | 'empty'), key index, field, expected value
/// then the number of writes, then per write:
///   kind ('set' | 'del'), key index, field, value
///
/// Returns: 1 if every condition held and the writes were applied, 0 otherwise
pub const HASH_TRANSACTION_SCRIPT: &str = r#"
local i = 1
local conditions = tonumber(ARGV[i])
i = i + 1

for _ = 1, conditions do
    local kind = ARGV[i]
    local key = KEYS[tonumber(ARGV[i + 1])]
    local field = ARGV[i + 2]
    local expected = ARGV[i + 3]
    i = i + 4

    if kind == 'eq' then
        if redis.call('HGET', key, field) ~= expected then
            return 0
        end
    elseif kind == 'absent' then
        if redis.call('HEXISTS', key, field) == 1 then
            return 0
        end
    elseif kind == 'empty' then
        if redis.call('HLEN', key) > 0 then
            return 0
        end
    else
        return redis.error_reply('unknown condition ' .. kind)
    end
end

local writes = tonumber(ARGV[i])
i = i + 1

for _ = 1, writes do
    local kind = ARGV[i]
    local key = KEYS[tonumber(ARGV[i + 1])]
    local field = ARGV[i + 2]
    local value = ARGV[i + 3]
    i = i + 4

    if kind == 'set' then
        redis.call('HSET', key, field, value)
    else
        redis.call('HDEL', key, field)
    end
end

return 1
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_are_valid() {
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZREMRANGEBYSCORE"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZADD"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("PEXPIRE"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("TIME"));

        assert!(COMPARE_AND_SET_SCRIPT.contains("GET"));
        assert!(COMPARE_AND_SET_SCRIPT.contains("'PX'"));

        assert!(HASH_TRANSACTION_SCRIPT.contains("HEXISTS"));
        assert!(HASH_TRANSACTION_SCRIPT.contains("HLEN"));
    }
}
