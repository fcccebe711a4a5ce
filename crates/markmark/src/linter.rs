//
// linter.rs
//
// Unresolved local document links
//

use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;

use crate::config::Config;
use crate::events::{Event, EventBus, EventKind};
use crate::references::{Link, References};
use crate::types::{LintReport, LintResult, Severity};

pub const UNRESOLVED_MESSAGE: &str = "Target is unresolved";

struct Inner {
    events: EventBus,
    references: References,
    config: Config,
    severity: Mutex<Severity>,
}

/// Re-lints the workspace on every `ReferencesChanged` and emits the
/// reports as `LinterLint`.
#[derive(Clone)]
pub struct Linter {
    inner: Arc<Inner>,
}

impl Linter {
    pub fn new(events: EventBus, references: References, config: Config) -> Self {
        let inner = Arc::new(Inner {
            events: events.clone(),
            references,
            severity: Mutex::new(config.unresolved_link_severity),
            config,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        events.on(EventKind::ReferencesChanged, move |_| {
            if let Some(inner) = weak.upgrade() {
                let linter = Linter { inner };
                let reports = linter.lint();
                linter.inner.events.emit(Event::LinterLint(Arc::new(reports)));
            }
        });

        Self { inner }
    }

    pub fn set_severity(&self, severity: Severity) {
        *self.inner.severity.lock().unwrap_or_else(|e| e.into_inner()) = severity;
    }

    /// One report per document with at least one finding, in link order.
    pub fn lint(&self) -> Vec<LintReport> {
        let severity = *self.inner.severity.lock().unwrap_or_else(|e| e.into_inner());
        let mut reports: IndexMap<_, Vec<LintResult>> = IndexMap::new();

        for link in self.inner.references.get_links() {
            if !self.is_unresolved_document_link(&link) {
                continue;
            }
            reports.entry(link.uri.clone()).or_default().push(LintResult {
                position: link.position,
                message: UNRESOLVED_MESSAGE.to_string(),
                severity,
            });
        }

        log::debug!("linter :: lint complete ({} documents with findings)", reports.len());

        reports
            .into_iter()
            .map(|(uri, results)| LintReport { uri, results })
            .collect()
    }

    /// Bare links to another document that no known anchor answers.
    /// Links carrying a fragment and external urls are not checked.
    fn is_unresolved_document_link(&self, link: &Link) -> bool {
        let target = &link.target_uri;
        link.anchor.is_none()
            && !matches!(target.scheme(), "http" | "https")
            && target.fragment().is_none()
            && self.inner.config.is_document_path(target.path())
    }
}
