use std::path::{Path, PathBuf};

use localdocs::{Catalog, DataDir, schema::SchemaVersion};
use rmcp::{
    ServiceExt,
    model::CallToolRequestParams,
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde_json::json;

/// A collection carried over from an older catalog: registered, but not
/// scanned until it is re-indexed, so no model is ever loaded.
fn setup_fixture(data_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let notes = data_dir.join("notes");
    std::fs::create_dir_all(&notes)?;
    std::fs::write(notes.join("hello.md"), "Hello world\nSecond line\n")?;
    let notes = notes.canonicalize()?;

    let data_dir = DataDir::resolve(Some(data_dir))?;
    let catalog = Catalog::open(&data_dir.catalog_db(SchemaVersion::CURRENT))?;
    let txn = catalog.begin()?;
    let folder_id = txn.insert_folder(&notes.to_string_lossy())?;
    let collection = txn.insert_collection("notes", None, None)?;
    txn.insert_collection_item(collection.id, folder_id)?;
    txn.commit()?;

    Ok(())
}

#[tokio::test]
async fn mcp_stdio_collections_roundtrip()
-> Result<(), Box<dyn std::error::Error>> {
    let tempdir = tempfile::tempdir()?;
    setup_fixture(tempdir.path())?;

    let bin = localdocs_bin()?;
    let transport = TokioChildProcess::new(
        tokio::process::Command::new(bin).configure(|cmd| {
            cmd.arg("mcp")
                .env("LOCALDOCS_DATA_DIR", tempdir.path())
                .env("LOCALDOCS_LOG", "warn");
        }),
    )?;

    let client = ().serve(transport).await?;

    let tools = client.list_all_tools().await?;
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
    assert!(names.contains(&"localdocs_retrieve"));
    assert!(names.contains(&"localdocs_collections"));

    let result = client
        .peer()
        .call_tool(CallToolRequestParams {
            meta: None,
            name: "localdocs_collections".into(),
            arguments: Some(json!({}).as_object().unwrap().clone()),
            task: None,
        })
        .await?;

    let structured = result.structured_content.expect("structured content");
    let collections = structured
        .get("collections")
        .and_then(|v| v.as_array())
        .expect("collections array");

    assert_eq!(collections.len(), 1);
    assert_eq!(
        collections[0].get("collection").and_then(|v| v.as_str()),
        Some("notes")
    );
    assert_eq!(
        collections[0]
            .get("force_indexing")
            .and_then(|v| v.as_bool()),
        Some(true)
    );

    client.cancel().await?;
    Ok(())
}

fn localdocs_bin() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(bin) = std::env::var("CARGO_BIN_EXE_localdocs") {
        return Ok(PathBuf::from(bin));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("localdocs");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    Ok(path)
}
