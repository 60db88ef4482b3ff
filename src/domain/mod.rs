pub mod order;
pub mod position;
pub mod ring;

pub use order::{Order, OrderState, Side};
pub use position::{PositionEntry, PositionTracker};
pub use ring::RingSet;
