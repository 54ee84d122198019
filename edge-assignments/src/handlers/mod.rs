pub mod assign;
pub mod health;

pub use assign::handle_assign;
pub use health::handle_health;
