//
// backend.rs
//
// tower-lsp server: maps requests and notifications onto the engine
//

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::Client;
use tower_lsp::LanguageServer;
use tower_lsp::LspService;
use tower_lsp::Server;

use crate::config::{parse_config, Config};
use crate::events::Event;
use crate::markmark::Markmark;
use crate::types::{self, LintReport, LocationRef, Positioned, Severity};

const SERVER_NAME: &str = "markmark";
const WATCHED_FILES_REGISTRATION: &str = "markmark-watched-files";

#[derive(Debug, Default)]
struct ServerState {
    /// Client registers file watchers for us.
    client_watches_files: bool,
    open_documents: HashSet<Url>,
    /// Documents whose last publish carried diagnostics.
    published: HashSet<Url>,
}

pub struct Backend {
    client: Client,
    engine: OnceLock<Arc<Markmark>>,
    state: Arc<RwLock<ServerState>>,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            engine: OnceLock::new(),
            state: Arc::new(RwLock::new(ServerState::default())),
        }
    }

    fn engine(&self) -> Option<&Arc<Markmark>> {
        self.engine.get()
    }

    fn start_engine(&self, config: Config) -> &Arc<Markmark> {
        self.engine.get_or_init(|| {
            let engine = Arc::new(Markmark::with_config(config));
            tokio::spawn(forward_lints(
                self.client.clone(),
                self.state.clone(),
                engine.subscribe(),
            ));
            engine
        })
    }

    async fn register_file_watchers(&self, config: &Config) {
        let watchers = config
            .document_extensions
            .iter()
            .map(|ext| FileSystemWatcher {
                glob_pattern: GlobPattern::String(format!("**/*.{}", ext)),
                kind: None,
            })
            .collect();
        let options = DidChangeWatchedFilesRegistrationOptions { watchers };

        let register_options = match serde_json::to_value(options) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to encode file watcher registration: {}", e);
                return;
            }
        };

        let registration = Registration {
            id: WATCHED_FILES_REGISTRATION.to_string(),
            method: "workspace/didChangeWatchedFiles".to_string(),
            register_options: Some(register_options),
        };
        if let Err(e) = self.client.register_capability(vec![registration]).await {
            log::warn!("Failed to register file watchers: {}", e);
        }
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        log::info!("Initializing {}", SERVER_NAME);

        let config = params
            .initialization_options
            .as_ref()
            .and_then(parse_config)
            .unwrap_or_default();

        let client_watches_files = params
            .capabilities
            .workspace
            .as_ref()
            .and_then(|w| w.did_change_watched_files.as_ref())
            .and_then(|d| d.dynamic_registration)
            .unwrap_or(false);
        self.state.write().await.client_watches_files = client_watches_files;

        let engine = self.start_engine(config);

        if let Some(folders) = params.workspace_folders {
            for folder in folders {
                log::info!("Adding workspace folder: {}", folder.uri);
                engine.add_root(&folder.uri);
            }
        } else if let Some(root_uri) = params.root_uri {
            log::info!("Adding root URI as workspace folder: {}", root_uri);
            engine.add_root(&root_uri);
        }

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::FULL,
                )),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![
                        String::from("#"),
                        String::from("("),
                        String::from("/"),
                    ]),
                    ..Default::default()
                }),
                definition_provider: Some(OneOf::Left(true)),
                references_provider: Some(OneOf::Left(true)),
                workspace: Some(WorkspaceServerCapabilities {
                    workspace_folders: Some(WorkspaceFoldersServerCapabilities {
                        supported: Some(true),
                        change_notifications: Some(OneOf::Left(true)),
                    }),
                    file_operations: None,
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: String::from(SERVER_NAME),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        log::info!("{} initialized", SERVER_NAME);

        let Some(engine) = self.engine().cloned() else {
            return;
        };
        let client_watches_files = self.state.read().await.client_watches_files;

        let watch = engine.config().watcher_enabled && !client_watches_files;
        if client_watches_files {
            self.register_file_watchers(engine.config()).await;
        }
        engine.init(watch).await;

        log::info!("Workspace initialization complete");
    }

    async fn shutdown(&self) -> Result<()> {
        log::info!("{} shutting down", SERVER_NAME);
        if let Some(engine) = self.engine() {
            engine.close();
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        self.state.write().await.open_documents.insert(uri.clone());

        let Some(engine) = self.engine() else {
            return;
        };
        if let Err(e) = engine.file_open(&uri, params.text_document.text).await {
            log::warn!("Failed to index opened document {}: {}", uri, e);
        }
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        // full sync: the last change carries the whole text
        let Some(change) = params.content_changes.into_iter().last() else {
            return;
        };
        let Some(engine) = self.engine() else {
            return;
        };
        if let Err(e) = engine.file_content_changed(&uri, change.text).await {
            log::warn!("Failed to index changed document {}: {}", uri, e);
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;

        let had_diagnostics = {
            let mut state = self.state.write().await;
            state.open_documents.remove(&uri);
            state.published.remove(&uri)
        };
        if had_diagnostics {
            self.client.publish_diagnostics(uri.clone(), Vec::new(), None).await;
        }

        if let Some(engine) = self.engine() {
            engine.file_closed(&uri);
        }
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        log::trace!("Configuration changed");

        let Some(config) = parse_config(&params.settings) else {
            log::warn!("No markmark section in settings, keeping current configuration");
            return;
        };
        if let Some(engine) = self.engine() {
            engine.apply_config(&config);
        }
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        log::trace!(
            "Received watched files change: {} changes",
            params.changes.len()
        );

        let Some(engine) = self.engine() else {
            return;
        };

        for change in params.changes {
            let uri = change.uri;
            if change.typ == FileChangeType::DELETED {
                engine.remove_file(&uri);
                continue;
            }
            // indexing proceeds without the waiter
            if change.typ == FileChangeType::CREATED {
                drop(engine.add_file(&uri));
            } else {
                drop(engine.update_file(&uri));
            }
        }
    }

    async fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) {
        let Some(engine) = self.engine() else {
            return;
        };
        for folder in params.event.removed {
            log::info!("Removing workspace folder: {}", folder.uri);
            engine.remove_root(&folder.uri);
        }
        for folder in params.event.added {
            log::info!("Adding workspace folder: {}", folder.uri);
            engine.add_root(&folder.uri);
        }
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let Some(engine) = self.engine() else {
            return Ok(None);
        };
        let location = location_ref(&params.text_document_position);
        let items: Vec<CompletionItem> = engine
            .get_completions(&location)
            .await
            .into_iter()
            .map(|completion| CompletionItem {
                label: completion.label,
                kind: Some(CompletionItemKind::REFERENCE),
                detail: completion.detail,
                text_edit: Some(CompletionTextEdit::Edit(TextEdit {
                    range: to_lsp_range(completion.replace.position),
                    new_text: completion.replace.new_text,
                })),
                ..Default::default()
            })
            .collect();

        Ok(Some(CompletionResponse::Array(items)))
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let Some(engine) = self.engine() else {
            return Ok(None);
        };
        let location = location_ref(&params.text_document_position_params);
        Ok(engine
            .find_definitions(&location)
            .into_iter()
            .next()
            .map(|definition| GotoDefinitionResponse::Scalar(to_lsp_location(definition))))
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        let Some(engine) = self.engine() else {
            return Ok(None);
        };
        let location = location_ref(&params.text_document_position);
        Ok(Some(
            engine
                .find_references(&location)
                .into_iter()
                .map(to_lsp_location)
                .collect(),
        ))
    }
}

/// Publish every lint round as diagnostics for open documents, clearing
/// documents that no longer have findings.
async fn forward_lints(
    client: Client,
    state: Arc<RwLock<ServerState>>,
    mut events: broadcast::Receiver<Event>,
) {
    loop {
        match events.recv().await {
            Ok(Event::LinterLint(reports)) => publish_reports(&client, &state, &reports).await,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Diagnostics stream lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn publish_reports(client: &Client, state: &RwLock<ServerState>, reports: &[LintReport]) {
    let (publish, stale) = {
        let mut state = state.write().await;
        let mut publish = Vec::new();
        let mut published = HashSet::new();

        for report in reports {
            if !state.open_documents.contains(&report.uri) {
                continue;
            }
            published.insert(report.uri.clone());
            publish.push((report.uri.clone(), to_diagnostics(report)));
        }

        let stale: Vec<Url> = state.published.difference(&published).cloned().collect();
        state.published = published;
        (publish, stale)
    };

    for (uri, diagnostics) in publish {
        client.publish_diagnostics(uri, diagnostics, None).await;
    }
    for uri in stale {
        client.publish_diagnostics(uri, Vec::new(), None).await;
    }
}

fn to_diagnostics(report: &LintReport) -> Vec<Diagnostic> {
    report
        .results
        .iter()
        .map(|result| Diagnostic {
            range: to_lsp_range(result.position),
            severity: Some(to_lsp_severity(result.severity)),
            source: Some(SERVER_NAME.to_string()),
            message: result.message.clone(),
            ..Default::default()
        })
        .collect()
}

fn to_lsp_severity(severity: Severity) -> DiagnosticSeverity {
    match severity {
        Severity::Error => DiagnosticSeverity::ERROR,
        Severity::Warn => DiagnosticSeverity::WARNING,
        Severity::Info => DiagnosticSeverity::INFORMATION,
        Severity::Hint => DiagnosticSeverity::HINT,
    }
}

fn location_ref(params: &TextDocumentPositionParams) -> LocationRef {
    LocationRef::new(params.text_document.uri.clone(), from_lsp_position(params.position))
}

fn from_lsp_position(position: Position) -> types::Point {
    types::Point::new(position.line + 1, position.character + 1)
}

fn to_lsp_position(point: types::Point) -> Position {
    Position::new(point.line.saturating_sub(1), point.column.saturating_sub(1))
}

/// The document range maps to the start of the document.
fn to_lsp_range(range: types::Range) -> Range {
    Range::new(to_lsp_position(range.start), to_lsp_position(range.end))
}

fn to_lsp_location(positioned: Positioned) -> Location {
    Location::new(positioned.uri, to_lsp_range(positioned.position))
}

pub async fn start_lsp() -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::new(Backend::new);
    Server::new(stdin, stdout, socket).serve(service).await;

    Ok(())
}
