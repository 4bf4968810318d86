pub mod core;
pub mod qr;
pub mod roster;
pub mod session;
pub mod students;
