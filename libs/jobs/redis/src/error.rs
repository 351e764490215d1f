use jobs::JobsError;
use redis::RedisError;

/// Map a Redis error onto the broker taxonomy. Anything that means the
/// socket is unusable becomes [`JobsError::Connection`] so the link redials.
pub(crate) fn from_redis(err: &RedisError) -> JobsError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || err.is_unrecoverable_error()
    {
        JobsError::connection(err.to_string())
    } else {
        JobsError::Internal(format!("redis: {err}"))
    }
}

pub(crate) trait RedisResultExt<T> {
    fn or_jobs(self) -> Result<T, JobsError>;
}

impl<T> RedisResultExt<T> for Result<T, RedisError> {
    fn or_jobs(self) -> Result<T, JobsError> {
        self.map_err(|e| from_redis(&e))
    }
}

/// Server reply codes the driver reacts to
pub(crate) fn has_code(err: &RedisError, code: &str) -> bool {
    err.code() == Some(code)
}
