pub mod engine;
pub mod keys;
pub mod processor;
pub mod producer;
pub mod queue;
pub mod stages;
pub mod status;
pub mod storage;
pub mod worker;
