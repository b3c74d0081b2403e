//! Run artifacts: the sink the session reports to, and its on-disk layout.
//!
//! ```text
//! <out>/<host>/<run>/
//!   run.json                  run parameters
//!   session.json              final SessionRecord
//!   steps/index.json          one entry per step
//!   steps/step_0000.png       screenshot the model saw
//!   steps/step_0000_actions.json
//!   steps/step_0000_request.json   (redacted)
//!   steps/step_0000_response.json
//!   pdps/pdp_001.json
//! ```

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::policy::PdpRecord;
use crate::session::{SessionRecord, StepRecord};
use crate::types::Viewport;

/// Receives artifacts as the session produces them.
///
/// Every PDP is reported exactly once, when finalized; `on_finish` is called
/// once per run on every exit path.
pub trait RunSink {
    fn on_start(&mut self, config: &SessionConfig) -> Result<()>;

    /// Store the screenshot for `step` and return a reference to it.
    fn store_screenshot(&mut self, step: usize, png: &[u8]) -> Result<String>;

    fn on_step(&mut self, step: &StepRecord) -> Result<()>;

    fn on_pdp(&mut self, pdp: &PdpRecord) -> Result<()>;

    fn on_finish(&mut self, session: &SessionRecord) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct StepIndexEntry {
    index: usize,
    url: String,
    viewport: Viewport,
    screenshot: String,
    actions: String,
    request: Option<String>,
    response: Option<String>,
    started_at: String,
}

/// Writes one run to `<out>/<host>/<run>/`.
#[derive(Debug)]
pub struct RunDirectory {
    root: PathBuf,
    index: Vec<StepIndexEntry>,
}

impl RunDirectory {
    /// Create a fresh run directory. An existing `run_name` gets `_2`, `_3`, ... appended.
    pub fn create(out_dir: &Path, start_url: &str, run_name: Option<&str>) -> Result<Self> {
        let host_dir = out_dir.join(host_dir_name(start_url));
        fs::create_dir_all(&host_dir)
            .with_context(|| format!("creating {}", host_dir.display()))?;

        let stem = match run_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => Local::now().format("run_%Y%m%d_%H%M%S").to_string(),
        };
        let root = unique_path(&host_dir.join(stem));
        for dir in [root.join("steps"), root.join("pdps")] {
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        info!(root = %root.display(), "run directory created");

        Ok(Self {
            root,
            index: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_json<T: Serialize + ?Sized>(&self, relative: &str, value: &T) -> Result<()> {
        let path = self.root.join(relative);
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), value)
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), "artifact written");
        Ok(())
    }
}

impl RunSink for RunDirectory {
    fn on_start(&mut self, config: &SessionConfig) -> Result<()> {
        self.write_json(
            "run.json",
            &json!({
                "started_at": Local::now().to_rfc3339(),
                "start_url": config.start_url,
                "host": host_dir_name(&config.start_url),
                "goal": config.goal,
                "model_name": config.model,
                "excluded_actions": config.excluded_actions,
                "min_variant_pdp": config.budget.min_variant,
                "min_variantless_pdp": config.budget.min_variantless,
                "max_pdp": config.budget.max_pdp,
                "on_minimums_met": config.budget.on_minimums_met,
                "max_steps": config.max_steps,
                "normalize_coords": config.normalize_coords,
                "wait": config.wait,
            }),
        )
    }

    fn store_screenshot(&mut self, step: usize, png: &[u8]) -> Result<String> {
        let relative = format!("steps/step_{step:04}.png");
        let path = self.root.join(&relative);
        fs::write(&path, png).with_context(|| format!("writing {}", path.display()))?;
        Ok(relative)
    }

    fn on_step(&mut self, step: &StepRecord) -> Result<()> {
        let stem = format!("steps/step_{:04}", step.index);
        let actions = format!("{stem}_actions.json");
        self.write_json(
            &actions,
            &json!({ "actions": step.proposed, "results": step.outcomes }),
        )?;

        let (mut request, mut response) = (None, None);
        if let Some(trace) = &step.trace {
            let req = format!("{stem}_request.json");
            let resp = format!("{stem}_response.json");
            self.write_json(&req, &trace.request)?;
            self.write_json(&resp, &trace.response)?;
            request = Some(req);
            response = Some(resp);
        }

        self.index.push(StepIndexEntry {
            index: step.index,
            url: step.url.clone(),
            viewport: step.viewport,
            screenshot: step.screenshot.clone(),
            actions,
            request,
            response,
            started_at: step.started_at.to_rfc3339(),
        });
        self.write_json("steps/index.json", &json!({ "steps": self.index }))
    }

    fn on_pdp(&mut self, pdp: &PdpRecord) -> Result<()> {
        info!(index = pdp.index, url = %pdp.url, captures = pdp.captures.len(), "writing pdp record");
        self.write_json(&format!("pdps/pdp_{:03}.json", pdp.index), pdp)
    }

    fn on_finish(&mut self, session: &SessionRecord) -> Result<()> {
        self.write_json("session.json", session)
    }
}

/// Directory-safe host of a URL, `site` if there is none.
pub fn host_dir_name(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host: String = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    if host.is_empty() {
        "site".to_string()
    } else {
        host
    }
}

fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    (2..)
        .map(|n| PathBuf::from(format!("{}_{n}", path.display())))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}
