pub mod adaptor;
pub mod error;
pub mod executor;
pub mod image;
pub mod meta;
pub mod model;
pub mod pricing;
pub mod quota;
pub mod retry;
pub mod token_meter;
