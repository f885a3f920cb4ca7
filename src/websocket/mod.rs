pub mod handler;
pub mod router;

pub use handler::websocket_handler;
pub use router::EventRouter;
