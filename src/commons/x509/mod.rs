//! X.509 building blocks: names, serial numbers, validity and time.

mod cert;
pub use self::cert::*;

mod name;
pub use self::name::*;

mod serial;
pub use self::serial::*;

mod time;
pub use self::time::*;

mod validity;
pub use self::validity::*;
