mod selector;

pub use selector::{BackendSelector, ShortestQueueFirst};
