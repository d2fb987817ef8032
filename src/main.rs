use std::{collections::HashMap, path::Path, sync::Arc};

use clap::Parser;
use kdam::{BarExt, tqdm};
use localdocs::{
    ColbertEmbedder,
    DataDir,
    IndexService,
    IndexerHandle,
    ServiceOptions,
    SettingsDb,
    catalog::FolderId,
    embedding::Embedder,
    error::{self, Error},
    events::{CollectionEntry, EventReceiver, FolderProgress, IndexEvent},
    mcp,
    model_manager::MODEL_ENV_VAR,
    retrieval::RetrievalResult,
    schema,
    settings,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, CollectionAction, Command, ConfigAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("LOCALDOCS_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    // Commands that only read what is on disk never start the engine.
    match &cli.command {
        Command::Collection {
            action: CollectionAction::List { json },
        } => return collection_list(&data_dir, *json),
        Command::Config {
            action: ConfigAction::Show { json },
        } => return config_show(&data_dir, *json),
        Command::Status(args) => return cmd_status(&data_dir, args.json),
        _ => {}
    }

    let embedder = resolve_embedder(&data_dir, cli.model)?;

    if let Command::Mcp = cli.command {
        return mcp::run_mcp(data_dir, embedder);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;
    runtime.block_on(run_command(cli.command, data_dir, embedder))
}

/// `--model`, else `LOCALDOCS_MODEL`, else the stored setting.
fn resolve_embedder(
    data_dir: &DataDir,
    model: Option<String>,
) -> error::Result<Arc<dyn Embedder>> {
    let model = match model {
        Some(model) => Some(model),
        None if std::env::var_os(MODEL_ENV_VAR).is_some() => None,
        None => {
            // Closed again before the service opens it.
            let settings = SettingsDb::open(&data_dir.settings_db())?;
            Some(settings.embedding_model()?)
        }
    };
    Ok(Arc::new(ColbertEmbedder::new(model)))
}

async fn run_command(
    command: Command,
    data_dir: DataDir,
    embedder: Arc<dyn Embedder>,
) -> error::Result<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut options = ServiceOptions::new(data_dir, embedder);
    options.watch = matches!(command, Command::Watch);
    options.events = Some(events_tx);

    let service = IndexService::spawn(options).await?;
    let result = dispatch(command, service.handle(), events_rx).await;
    service.shutdown().await;
    result
}

async fn dispatch(
    command: Command,
    handle: IndexerHandle,
    events: EventReceiver,
) -> error::Result<()> {
    match command {
        Command::Collection { action } => match action {
            CollectionAction::Add { name, path } => {
                collection_add(&handle, events, &name, &path).await
            }
            CollectionAction::Remove { name, path } => {
                handle.remove_folder(&name, &path).await?;
                println!("Removed {} from '{name}'", path.display());
                Ok(())
            }
            CollectionAction::List { .. } => Ok(()),
        },
        Command::Reindex { collection } => {
            handle.force_indexing(&collection).await?;
            eprintln!("Re-indexing collection '{collection}'...");
            drive_to_idle(&handle, events).await
        }
        Command::Index => drive_to_idle(&handle, events).await,
        Command::Watch => {
            eprintln!("Watching folders, press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            eprintln!("Stopping...");
            Ok(())
        }
        Command::Retrieve(args) => {
            let collections = if args.collections.is_empty() {
                all_collection_names(&handle).await?
            } else {
                args.collections
            };
            let results =
                handle.retrieve(collections, &args.query, args.count).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                format_human(&results);
            }
            Ok(())
        }
        Command::Config { action } => match action {
            ConfigAction::ChunkSize { size } => {
                if handle.change_chunk_size(size).await? {
                    eprintln!("Chunk size set to {size}, re-chunking...");
                    drive_to_idle(&handle, events).await?;
                } else {
                    println!("Chunk size is already {size}");
                }
                Ok(())
            }
            ConfigAction::Extensions { extensions } => {
                let extensions =
                    settings::parse_extensions(&extensions.join(","));
                handle.change_file_extensions(extensions.clone()).await?;
                eprintln!("Indexing extensions: {}", extensions.join(", "));
                drive_to_idle(&handle, events).await
            }
            ConfigAction::Show { .. } => Ok(()),
        },
        Command::Status(_) | Command::Mcp | Command::Completions(_) => Ok(()),
    }
}

// -- Collections --

async fn collection_add(
    handle: &IndexerHandle,
    events: EventReceiver,
    name: &str,
    path: &Path,
) -> error::Result<()> {
    if handle.add_folder(name, path).await? {
        println!("Added {} to '{name}'", path.display());
    } else {
        println!("{} is already in '{name}'", path.display());
    }
    drive_to_idle(handle, events).await
}

async fn all_collection_names(
    handle: &IndexerHandle,
) -> error::Result<Vec<String>> {
    let mut names: Vec<String> = handle
        .collections()
        .await?
        .into_iter()
        .map(|status| status.entry.collection)
        .collect();
    names.dedup();
    Ok(names)
}

fn collection_list(data_dir: &DataDir, json: bool) -> error::Result<()> {
    let (catalog, _) = schema::open_latest(data_dir)?;
    let entries: Vec<CollectionEntry> = catalog
        .read()?
        .select_all_collections()?
        .iter()
        .map(CollectionEntry::from)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No collections registered.");
    } else {
        for entry in &entries {
            let model = entry
                .embedding_model
                .as_deref()
                .unwrap_or("(needs reindex)");
            println!("{}\t{}\t{model}", entry.collection, entry.folder_path);
        }
    }
    Ok(())
}

// -- Progress --

/// Wait until the engine has nothing left to scan or embed, drawing a
/// byte-based progress bar from the published folder events.
async fn drive_to_idle(
    handle: &IndexerHandle,
    mut events: EventReceiver,
) -> error::Result<()> {
    let mut folders: HashMap<FolderId, FolderProgress> = HashMap::new();
    let mut pb = tqdm!(desc = "Indexing", unit = "B", unit_scale = true);

    let idle = handle.wait_idle();
    tokio::pin!(idle);

    loop {
        tokio::select! {
            result = &mut idle => {
                let _ = pb.clear();
                result?;
                break;
            }
            Some(event) = events.recv() => match event {
                IndexEvent::FolderUpdated(progress) => {
                    if let Some(e) = &progress.error {
                        tracing::warn!(
                            folder = %progress.folder_path,
                            error = %e,
                            "Indexing error"
                        );
                    }
                    folders.insert(progress.folder_id, progress);
                    draw(&mut pb, &folders);
                }
                IndexEvent::FolderRemoved { folder_id, .. } => {
                    folders.remove(&folder_id);
                }
                IndexEvent::DatabaseInvalid => {
                    return Err(Error::DatabaseInvalid);
                }
                IndexEvent::FolderAdded(_)
                | IndexEvent::CollectionListUpdated(_) => {}
            },
        }
    }

    let docs: usize = folders.values().map(|p| p.total_docs).sum();
    let embedded: usize = folders
        .values()
        .map(|p| p.total_embeddings_to_index)
        .sum();
    eprintln!("Done: {docs} documents, {embedded} chunks embedded.");
    Ok(())
}

fn draw(pb: &mut kdam::Bar, folders: &HashMap<FolderId, FolderProgress>) {
    let total: u64 = folders.values().map(|p| p.total_bytes_to_index).sum();
    let remaining: u64 =
        folders.values().map(|p| p.current_bytes_to_index).sum();
    let current = folders
        .values()
        .find_map(|p| p.file_currently_processing.as_deref())
        .unwrap_or("");

    pb.total = usize::try_from(total).unwrap_or(usize::MAX);
    pb.set_postfix(current.to_string());
    let _ = pb.update_to(
        usize::try_from(total.saturating_sub(remaining)).unwrap_or(usize::MAX),
    );
}

// -- Output --

fn format_human(results: &[RetrievalResult]) {
    if results.is_empty() {
        println!("No passages found.");
        return;
    }
    for (rank, result) in results.iter().enumerate() {
        let mut heading = format!("{}. {}", rank + 1, result.file);
        if result.page > 0 {
            heading.push_str(&format!(", page {}", result.page));
        }
        if !result.title.is_empty() {
            heading.push_str(&format!(" \"{}\"", result.title));
        }
        println!("{heading} ({})", result.date);
        println!("{}\n", result.text.trim());
    }
}

fn config_show(data_dir: &DataDir, json: bool) -> error::Result<()> {
    let settings = SettingsDb::open(&data_dir.settings_db())?;
    let chunk_size = settings.chunk_size()?;
    let extensions = settings.file_extensions()?;
    let model = std::env::var(MODEL_ENV_VAR)
        .or_else(|_| settings.embedding_model())?;

    if json {
        let value = serde_json::json!({
            "chunk_size": chunk_size,
            "file_extensions": extensions,
            "embedding_model": model,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Chunk size: {chunk_size}");
        println!("File extensions: {}", extensions.join(", "));
        println!("Embedding model: {model}");
    }
    Ok(())
}

fn cmd_status(data_dir: &DataDir, json: bool) -> error::Result<()> {
    let model = {
        let settings = SettingsDb::open(&data_dir.settings_db())?;
        std::env::var(MODEL_ENV_VAR).or_else(|_| settings.embedding_model())?
    };

    let (catalog, _) = schema::open_latest(data_dir)?;
    let reader = catalog.read()?;
    let rows = reader.select_all_collections()?;

    let mut folders = Vec::with_capacity(rows.len());
    for row in &rows {
        let stats = reader.folder_statistics(row.folder_id)?;
        folders.push((CollectionEntry::from(row), stats));
    }

    if json {
        let collections: Vec<_> = folders
            .iter()
            .map(|(entry, stats)| {
                serde_json::json!({
                    "collection": entry.collection,
                    "folder": entry.folder_path,
                    "embedding_model": entry.embedding_model,
                    "force_indexing": entry.force_indexing,
                    "last_update": entry.last_update,
                    "documents": stats.total_docs,
                    "words": stats.total_words,
                })
            })
            .collect();
        let value = serde_json::json!({
            "data_dir": data_dir.root().display().to_string(),
            "model": model,
            "collections": collections,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Model: {model}");
        println!("Folders: {}", folders.len());
        for (entry, stats) in &folders {
            let state = if entry.force_indexing {
                "needs reindex".to_string()
            } else {
                match entry.last_update {
                    Some(millis) => format!(
                        "updated {}",
                        localdocs::retrieval::format_document_date(millis)
                    ),
                    None => "not indexed".to_string(),
                }
            };
            println!(
                "  {}: {} ({} docs, {} words, {state})",
                entry.collection,
                entry.folder_path,
                stats.total_docs,
                stats.total_words
            );
        }
    }
    Ok(())
}
