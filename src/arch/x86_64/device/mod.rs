/// Legacy programmable interrupt controller
pub mod pic;
