// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Local zero-shot classification
//!
//! The model is loaded once and owned by a dedicated thread. Workers submit
//! requests over a queue and await the reply, so model state is never shared
//! between threads.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::Classifier;
use crate::config::LocalModelConfig;
use crate::model::{ClassifierSource, LabelSet, Verdict};
use crate::{Result, TidyfoldError};

/// A model that scores each candidate label against a text
pub trait ZeroShotModel: Send + 'static {
    fn version(&self) -> &str;

    /// One score in [0, 1] per label, in label order
    fn score(&mut self, text: &str, labels: &[String]) -> Result<Vec<f32>>;
}

struct ScoreRequest {
    text: String,
    labels: Vec<String>,
    reply: oneshot::Sender<Result<Vec<f32>>>,
}

/// Queue-served handle to a [`ZeroShotModel`]
pub struct LocalClassifier {
    requests: mpsc::UnboundedSender<ScoreRequest>,
    version: String,
    floor: f32,
}

impl LocalClassifier {
    /// Load the configured model
    pub fn load(config: &LocalModelConfig, floor: f32) -> Result<Self> {
        match config.model.as_str() {
            "keyword" => Self::with_model(KeywordModel::new(), floor),
            other => Err(TidyfoldError::LocalModel(format!("unknown local model '{}'", other))),
        }
    }

    /// Start the model thread for an already constructed model
    pub fn with_model<M: ZeroShotModel>(mut model: M, floor: f32) -> Result<Self> {
        let version = model.version().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<ScoreRequest>();

        std::thread::Builder::new()
            .name("tidyfold-local-model".to_string())
            .spawn(move || {
                // Exits once every handle has been dropped
                while let Some(request) = rx.blocking_recv() {
                    let scores = model.score(&request.text, &request.labels);
                    let _ = request.reply.send(scores);
                }
                debug!("Local model thread stopped");
            })
            .map_err(|e| TidyfoldError::LocalModel(format!("failed to start model thread: {}", e)))?;

        info!("Loaded local model {}", version);
        Ok(Self { requests: tx, version, floor })
    }
}

#[async_trait]
impl Classifier for LocalClassifier {
    fn source(&self) -> ClassifierSource {
        ClassifierSource::Local
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    async fn classify(&self, text: &str, labels: &LabelSet) -> Result<Verdict> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ScoreRequest {
                text: text.to_string(),
                labels: labels.labels().to_vec(),
                reply,
            })
            .map_err(|_| TidyfoldError::LocalModel("model thread is not running".into()))?;

        let scores = response
            .await
            .map_err(|_| TidyfoldError::LocalModel("model thread dropped the request".into()))??;

        if scores.len() != labels.len() {
            return Err(TidyfoldError::LocalModel(format!(
                "model returned {} scores for {} labels",
                scores.len(),
                labels.len()
            )));
        }

        // Ties go to the earlier label
        let (best, confidence) = scores
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::MIN), |acc, (i, s)| if s > acc.1 { (i, s) } else { acc });

        let verdict = if confidence < self.floor {
            Verdict::uncategorized(confidence)
        } else {
            Verdict::new(labels.labels()[best].clone(), confidence)
        };
        Ok(verdict)
    }
}

/// Category vocabulary the keyword model knows about
struct Family {
    names: &'static [&'static str],
    extensions: &'static [&'static str],
    keywords: &'static [&'static str],
}

const FAMILIES: &[Family] = &[
    Family {
        names: &["documents", "document", "docs", "papers", "paperwork", "text", "notes"],
        extensions: &["pdf", "doc", "docx", "odt", "rtf", "txt", "md", "tex", "pages", "log"],
        keywords: &[
            "invoice", "receipt", "report", "letter", "contract", "resume", "cv", "notes",
            "statement", "manual", "guide", "agenda", "memo", "tax", "minutes", "draft",
            "dear", "sincerely", "summary", "chapter", "meeting",
        ],
    },
    Family {
        names: &["images", "image", "photos", "photo", "pictures", "pics", "screenshots", "graphics"],
        extensions: &["jpg", "jpeg", "png", "gif", "webp", "heic", "bmp", "tiff", "tif", "svg", "raw", "cr2", "nef", "ico"],
        keywords: &[
            "img", "image", "photo", "screenshot", "screen", "shot", "vacation", "camera",
            "dsc", "pic", "wallpaper", "selfie", "pxl", "scan",
        ],
    },
    Family {
        names: &["music", "audio", "songs", "sounds", "podcasts", "recordings"],
        extensions: &["mp3", "wav", "flac", "ogg", "m4a", "aac", "wma", "aiff", "opus", "mid"],
        keywords: &["song", "track", "album", "podcast", "recording", "voice", "mix", "remix", "live", "demo"],
    },
    Family {
        names: &["videos", "video", "movies", "films", "clips"],
        extensions: &["mp4", "mkv", "webm", "avi", "mov", "wmv", "flv", "m4v", "mpg", "mpeg"],
        keywords: &["movie", "video", "clip", "episode", "trailer", "film", "season", "vid"],
    },
    Family {
        names: &["archives", "archive", "compressed", "backups"],
        extensions: &["zip", "tar", "gz", "tgz", "7z", "rar", "bz2", "xz", "zst"],
        keywords: &["backup", "archive", "export", "bundle"],
    },
    Family {
        names: &["code", "source", "programming", "scripts", "projects", "development"],
        extensions: &[
            "rs", "py", "js", "ts", "go", "java", "c", "cpp", "h", "hpp", "rb", "php", "sh",
            "css", "html", "json", "yaml", "yml", "toml", "sql", "kt", "swift",
        ],
        keywords: &[
            "src", "main", "lib", "test", "script", "fn", "def", "function", "import",
            "class", "return", "const", "include", "package",
        ],
    },
    Family {
        names: &["spreadsheets", "spreadsheet", "sheets", "data", "finance", "finances"],
        extensions: &["xls", "xlsx", "csv", "ods", "tsv", "numbers"],
        keywords: &["budget", "sheet", "data", "table", "expenses", "sales", "totals", "quarterly"],
    },
    Family {
        names: &["presentations", "presentation", "slides", "decks"],
        extensions: &["ppt", "pptx", "odp", "key"],
        keywords: &["slides", "deck", "presentation", "pitch", "keynote", "talk"],
    },
    Family {
        names: &["installers", "installer", "apps", "applications", "programs", "software"],
        extensions: &["exe", "msi", "dmg", "pkg", "deb", "rpm", "appimage", "apk"],
        keywords: &["setup", "installer", "install", "x64", "amd64", "win"],
    },
    Family {
        names: &["ebooks", "ebook", "books"],
        extensions: &["epub", "mobi", "azw", "azw3", "fb2"],
        keywords: &["book", "chapter", "edition", "novel"],
    },
];

const EXTENSION_WEIGHT: f32 = 3.0;
const NAME_WEIGHT: f32 = 1.0;
const SNIPPET_WEIGHT: f32 = 0.25;
const LABEL_WORD_WEIGHT: f32 = 1.5;
/// Evidence needed before a label looks certain; zero evidence scores zero
const PRIOR: f32 = 1.0;

/// Built-in lexical zero-shot model
///
/// Scores labels by how strongly the filename, extension and snippet point at
/// the label's vocabulary. Labels outside the built-in vocabulary are matched
/// on their own words only.
#[derive(Debug, Default)]
pub struct KeywordModel;

impl KeywordModel {
    pub fn new() -> Self {
        Self
    }

    fn evidence(label: &str, name: &[String], extension: Option<&str>, snippet: &[String]) -> f32 {
        let label_words: Vec<String> = tokens(label);
        let family = FAMILIES.iter().find(|f| {
            let lower = label.to_lowercase();
            f.names.contains(&lower.as_str())
                || label_words.iter().any(|w| f.names.contains(&w.as_str()))
        });

        let mut score = 0.0;
        let mut seen = HashSet::new();

        if let Some(family) = family {
            if extension.is_some_and(|e| family.extensions.contains(&e)) {
                score += EXTENSION_WEIGHT;
            }
            let name_hits = name
                .iter()
                .filter(|t| family.keywords.contains(&t.as_str()) && seen.insert(t.as_str()))
                .count()
                .min(3);
            score += NAME_WEIGHT * name_hits as f32;
            let snippet_hits = snippet
                .iter()
                .filter(|t| family.keywords.contains(&t.as_str()))
                .count()
                .min(8);
            score += SNIPPET_WEIGHT * snippet_hits as f32;
        }

        let label_hits = name
            .iter()
            .filter(|t| label_words.iter().any(|w| same_word(t, w)))
            .count()
            .min(2);
        score += LABEL_WORD_WEIGHT * label_hits as f32;
        score
    }
}

impl ZeroShotModel for KeywordModel {
    fn version(&self) -> &str {
        "keyword-v1"
    }

    fn score(&mut self, text: &str, labels: &[String]) -> Result<Vec<f32>> {
        let (name_line, snippet) = text.split_once('\n').unwrap_or((text, ""));
        let mut name = tokens(name_line);
        // Feature text puts the extension last on the name line
        let extension = name.pop();
        let snippet = tokens(snippet);

        // A bare name with no extension still counts as name evidence
        if let Some(ext) = extension.as_deref() {
            if !FAMILIES.iter().any(|f| f.extensions.contains(&ext)) {
                name.push(ext.to_string());
            }
        }

        let raw: Vec<f32> = labels
            .iter()
            .map(|label| Self::evidence(label, &name, extension.as_deref(), &snippet))
            .collect();
        let total: f32 = raw.iter().sum::<f32>() + PRIOR;
        Ok(raw.into_iter().map(|s| s / total).collect())
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Plural-tolerant word match ("invoice" vs "invoices")
fn same_word(a: &str, b: &str) -> bool {
    let a = a.trim_end_matches('s');
    let b = b.trim_end_matches('s');
    !a.is_empty() && a == b
}
