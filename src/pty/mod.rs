pub mod ring;
pub mod session;

pub use ring::ReplayRing;
pub use session::{Session, Subscription};
