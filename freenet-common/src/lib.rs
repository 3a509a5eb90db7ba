// Allow some clippy lints for legacy code - to be fixed gradually
#![allow(clippy::module_inception)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod time;
pub mod tokio;
