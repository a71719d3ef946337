//! Use-case services. Imports only from `crate::domain` and
//! `crate::application::ports`.

pub mod agents;
