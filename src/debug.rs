// feature=std? log to stdout
//   feature=defmt (and no std)? log through defmt
//     neither? log nothing

#[cfg(feature = "std")]
pub use std::{println as info, println as trace, println as warn};

#[cfg(all(not(feature = "std"), feature = "defmt"))]
pub use defmt::{info, trace, warn};

#[cfg(all(not(feature = "std"), not(feature = "defmt")))]
macro_rules! trace {
    ($fmt:expr) => {};
    ($fmt:expr, $($arg:tt)*) => {};
}

#[cfg(all(not(feature = "std"), not(feature = "defmt")))]
macro_rules! info {
    ($fmt:expr) => {};
    ($fmt:expr, $($arg:tt)*) => {};
}

#[cfg(all(not(feature = "std"), not(feature = "defmt")))]
macro_rules! warn {
    ($fmt:expr) => {};
    ($fmt:expr, $($arg:tt)*) => {};
}

#[cfg(all(not(feature = "std"), not(feature = "defmt")))]
pub(crate) use {info, trace, warn};
