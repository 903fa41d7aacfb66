pub mod forward;
pub mod logs;
pub mod rollback;
pub mod status;
pub mod update;
pub mod watch;
