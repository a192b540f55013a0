//! GCP API interaction module
//!
//! This module provides the pieces of Google Cloud Platform access the
//! collector needs: authentication, an HTTP client that decodes Google error
//! bodies, lazy pagination and the Pub/Sub listing client.
//!
//! # Module Structure
//!
//! - [`auth`] - GCP authentication using Application Default Credentials
//! - [`client`] - Pub/Sub client plus the [`client::PubSubApi`] / [`client::ClientProvider`] seams
//! - [`http`] - HTTP utilities for REST API calls
//! - [`pager`] - Page-token driven lazy streams
//! - [`projects`] - Project discovery through Resource Manager
//!
//! # Example
//!
//! ```ignore
//! use futures::TryStreamExt;
//! use crate::gcp::client::{ClientProvider, GcpClientProvider};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let provider = GcpClientProvider::from_environment().await?;
//!     let client = provider.get_client("my-project").await?;
//!     let topics: Vec<_> = client.list_topics("my-project").try_collect().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod http;
pub mod pager;
pub mod projects;
