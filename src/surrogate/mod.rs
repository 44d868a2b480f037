//! The trusted stand-in proxies the sandboxed browser talks to instead of
//! the real control port, SOCKS port, and X11 display.

pub mod circuits;
pub mod ctrl;
pub mod socks;
pub mod x11;
