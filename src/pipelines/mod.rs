pub mod event_stream;
pub mod polling_queue;
pub mod router;

pub use router::UpdateRouter;
