pub mod dispatch;

pub use dispatch::DispatchService;
