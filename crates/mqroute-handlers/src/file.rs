//! `file` handler: appends (or overwrites) the message to a file.
//!
//! Handler config keys `append_newline` and `overwrite` set defaults; a
//! table address may override both per target. The path is interpolated
//! with the message data, `$TMPDIR` and `~` are expanded.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use mqroute_core::error::{Result, RouterError};
use mqroute_core::traits::Handler;
use mqroute_core::types::WorkItem;
use mqroute_core::ServiceContext;
use mqroute_engine::format::format;

use crate::first_address;

pub struct FileHandler;

#[derive(Debug, PartialEq)]
struct FileTarget {
    path: String,
    append_newline: bool,
    overwrite: bool,
}

fn flag(map: &Map<String, Value>, key: &str) -> Option<bool> {
    map.get(key).and_then(Value::as_bool)
}

fn file_target(item: &WorkItem) -> Result<FileTarget> {
    let mut append_newline = flag(&item.config, "append_newline").unwrap_or(false);
    let mut overwrite = flag(&item.config, "overwrite").unwrap_or(false);

    let template = match &item.addrs {
        Value::Object(table) => {
            append_newline = flag(table, "append_newline").unwrap_or(append_newline);
            overwrite = flag(table, "overwrite").unwrap_or(overwrite);
            table.get("path").and_then(Value::as_str)
        }
        other => first_address(other).and_then(Value::as_str),
    }
    .ok_or_else(|| RouterError::Handler(format!("file target `{}` has no path", item.target)))?;

    let path = format(template, &item.data).map_err(|e| RouterError::Handler(e.to_string()))?;
    let path = path.replace("$TMPDIR", &std::env::temp_dir().to_string_lossy());
    Ok(FileTarget {
        path: shellexpand::tilde(&path).into_owned(),
        append_newline,
        overwrite,
    })
}

#[async_trait]
impl Handler for FileHandler {
    fn name(&self) -> &str {
        "file"
    }

    async fn handle(&self, _ctx: &ServiceContext, item: &WorkItem) -> Result<bool> {
        let target = file_target(item)?;
        tracing::info!("📝 Writing to file `{}`", target.path);

        let mut text = item.message.clone();
        if target.append_newline {
            text.push('\n');
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true);
        if target.overwrite {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }

        let written = async {
            let mut file = options.open(&target.path).await?;
            file.write_all(text.as_bytes()).await?;
            file.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!("❌ Cannot write to file `{}`: {}", target.path, e);
                Ok(false)
            }
        }
    }
}
