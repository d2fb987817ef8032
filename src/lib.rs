//! localdocs - incremental indexing and semantic retrieval over local folders.
//!
//! Folders are linked into named collections. Their text (and, with a
//! loader installed, PDF) files are cut into word-bounded chunks, stored in
//! a [redb](https://github.com/cberner/redb) catalog and embedded with a
//! [ColBERT](https://github.com/stanford-futuredata/ColBERT) model. The
//! index follows the filesystem: changed, deleted and unreadable files are
//! reconciled, and an interrupted scan resumes where it stopped.
//!
//! # Quick start
//!
//! ```no_run
//! use std::{path::Path, sync::Arc};
//!
//! use localdocs::{ColbertEmbedder, DataDir, IndexService, ServiceOptions};
//!
//! # async fn run() -> localdocs::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let embedder = Arc::new(ColbertEmbedder::new(None));
//! let service =
//!     IndexService::spawn(ServiceOptions::new(data_dir, embedder)).await?;
//!
//! let index = service.handle();
//! index.add_folder("notes", Path::new("/home/me/notes")).await?;
//! index.wait_idle().await?;
//!
//! let results = index
//!     .retrieve(vec!["notes".to_string()], "borrow checker", 5)
//!     .await?;
//! for r in &results {
//!     println!("{} ({}): {}", r.file, r.date, r.text);
//! }
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod catalog;
pub mod chunking;
pub mod data_dir;
pub mod embedding;
pub mod error;
pub mod events;
pub mod indexer;
pub mod mcp;
pub mod model_manager;
pub mod pdf;
pub mod retrieval;
pub mod scan_queue;
pub mod schema;
pub mod service;
pub mod settings;
pub mod text_reader;
pub mod vector_store;
pub mod walker;
pub mod watcher;

pub use catalog::Catalog;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use indexer::{Indexer, IndexerConfig};
pub use model_manager::{ColbertEmbedder, ModelManager};
pub use retrieval::RetrievalResult;
pub use service::{IndexService, IndexerHandle, ServiceOptions};
pub use settings::SettingsDb;
pub use vector_store::RedbVectorStore;
