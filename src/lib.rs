//! Pages Gateway
//!
//! A multi-tenant static-site serving gateway that fronts a git hosting
//! backend. Each repository's pages branch is a site: the gateway resolves
//! every incoming request host and path to a concrete
//! `(owner, repository, commit, path)` tuple, applies the site's declarative
//! filter pipeline from its committed `.pages.yaml`, and streams the bytes
//! (or a generated response) to the client.
//!
//! # Overview
//!
//! - **Host resolution**: `<owner>.<base-domain>/<repo>/...` resolves
//!   structurally, falling back to the owner's default repository; any other
//!   hostname resolves through the alias registry populated from site
//!   configuration (`alias:` entries and `CNAME` files).
//! - **Site metadata**: a repository is compiled at a pinned commit into a
//!   [`meta::SiteMeta`] (aliases, filter chain, commit info), cached with a
//!   TTL, protected by single-flight locking and refreshed in the background.
//! - **Filter pipeline**: glob-routed middleware composed per request with a
//!   built-in library: `redirect`, `direct` (static files), `failback`,
//!   `default_not_found`, `block`, `reverse_proxy`, `template` and `script`.
//! - **Two-tier caching**: a TTL key-value store for metadata and a blob
//!   cache (with 404 negative entries and a size ceiling) for file bytes,
//!   both namespaced, in front of a semaphore-bounded backend client.
//!
//! # Architecture
//!
//! - [`backend::Backend`]: read-only view of the git host
//!   ([`gitea::GiteaBackend`] and [`local::LocalBackend`])
//! - [`provider_cache::CachedBackend`]: blob + negative caching wrapper
//! - [`kv::Kv`] / [`blob_cache::BlobCache`]: namespaced store abstractions
//! - [`locker::Locker`]: per-key single-flight registry
//! - [`alias::AliasRegistry`]: hostname to repository bindings with
//!   CAS-guarded rebind
//! - [`meta::MetaEngine`]: site compilation and refresh
//! - [`resolver::HostResolver`]: request host and path resolution
//! - [`filter`] / [`filters`]: the middleware model and the built-in library
//! - [`server::PageServer`]: the HTTP entry point
//!
//! # Configuration
//!
//! Loaded from YAML, see [`config::ServerConfig`]:
//!
//! ```yaml
//! bind: 0.0.0.0:8080
//! base_domain: example.com
//! scheme: https
//! backend:
//!   branch: gh-pages
//!   gitea:
//!     server: https://git.example.com
//!     token: "..."
//! cache:
//!   meta_ttl: 60
//!   blob_ttl: 3600
//!   blob_limit: 1048576
//! ```
//!
//! # Site configuration
//!
//! A site opts into filters with a `.pages.yaml` at the root of its pages
//! branch:
//!
//! ```yaml
//! alias:
//!   - www.example.org
//! routes:
//!   - path: "api/**"
//!     reverse_proxy:
//!       prefix: /api
//!       target: https://backend.internal:8443
//!   - path: "drafts/**,private/**"
//!     block:
//!       code: 403
//! ```

pub mod alias;
pub mod backend;
pub mod blob_cache;
pub mod body;
pub mod config;
pub mod error;
pub mod filter;
pub mod filters;
pub mod gitea;
pub mod glob_cache;
pub mod kv;
pub mod local;
pub mod locker;
pub mod meta;
pub mod provider_cache;
pub mod resolver;
pub mod server;
pub mod subscribe;
pub mod vfs;

pub use backend::{Backend, BranchMeta, FileResponse};
pub use config::ServerConfig;
pub use error::{PagesError, Result};
pub use filter::{Filter, FilterCall, FilterContext, Next, PageRequest, PageResponse, Params};
pub use meta::SiteMeta;
pub use resolver::SiteContext;
pub use server::{PageServer, PageServerOptions};
