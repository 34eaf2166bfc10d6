/*
Copyright 2024 The lxe Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! lxe is a Kubernetes Container Runtime Interface (CRI) server backed by an
//! LXD-style system container manager.
//!
//! The crate hosts the CRI runtime RPC endpoint and the exec/port-forward
//! streaming endpoint, translates pod and container specifications onto the
//! manager's flat configuration model, and drives pluggable pod networking.
//! The manager itself sits behind the [`backend::Backend`] trait; the
//! embedding daemon wires a concrete client and calls
//! [`runtime::RuntimeServer::serve`].

pub mod api;
pub mod backend;
pub mod config;
pub mod convert;
pub mod error;
pub mod network;
pub mod runtime;
pub mod streaming;

#[cfg(test)]
pub mod testing;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::{RuntimeServer, RuntimeShared};
