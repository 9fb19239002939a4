pub mod correlation;
pub mod rate_limit;
pub mod tenant;
