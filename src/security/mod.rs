pub mod audit_log;
pub mod cipher;
pub mod signature;
pub mod token_cache;
pub mod token_refresh;
