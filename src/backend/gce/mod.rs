// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Google Compute Engine backend.
//!
//! Boots one preemptible VM per job from a language-selected image,
//! reaches it over SSH on its NAT address, uploads the build script via
//! SFTP, and runs it under a PTY. The control plane is the Compute REST
//! API with zone-operation polling; credentials are a service-account
//! key exchanged through the OAuth2 JWT bearer grant.

mod api;
mod auth;
mod images;
mod instance;
mod provider;

pub use auth::ServiceAccountKey;
pub use provider::{GceProvider, GceProviderConfig};
