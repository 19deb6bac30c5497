//! Builds the bounded prompt context for one AI turn.

use chrono::Utc;
use minijinja::{context, Environment, UndefinedBehavior};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};

use crate::error::Error;
use crate::store::{AdminSettings, DataStore, DocumentRecord, UserProfile};

pub const TRUNCATION_MARKER: &str = "[... document truncated ...]";

const BINARY_MARKERS: &[&str] = &[
    "endstream",
    "endobj",
    "startxref",
    "xref",
    "%PDF-",
    "/FlateDecode",
];

/// Text where more than one char in this many is a control or replacement char is binary
const CONTROL_CHAR_DENOMINATOR: usize = 10;

const MIN_KEYWORD_CHARS: usize = 4;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant for {{ company_name }}. \
Answer questions about our services clearly and concisely, using the reference documents \
when they are relevant. Address the user as {{ user_name }} where appropriate. \
Today is {{ current_date }}.";

const PRIORITY_INSTRUCTION: &str = "\n\nAfter your answer, on its own line, rate how likely \
this conversation is to turn into business for us as [PRIORITY_SCORE: N], where N is an \
integer from 0 to 100. Never mention the score otherwise.";

#[expect(clippy::expect_used)]
static TEMPLATE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{.*?\}\}|\{%.*?%\}|\{#.*?#\}").expect("template tag pattern is valid")
});

/// One prior message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TurnMessage {
    pub role: String,
    pub content: String,
}

impl TurnMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Everything the provider needs for one turn. Built fresh and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationContext {
    pub system_prompt: String,
    pub documents_block: String,
    pub user_facts_block: String,
    pub history_block: String,
    pub turn_input: String,
}

impl ConversationContext {
    /// The full instructions: base prompt, then documents, user facts and history
    pub fn instructions(&self) -> String {
        let mut out = String::with_capacity(
            self.system_prompt.len()
                + self.documents_block.len()
                + self.user_facts_block.len()
                + self.history_block.len(),
        );
        out.push_str(&self.system_prompt);
        out.push_str(&self.documents_block);
        out.push_str(&self.user_facts_block);
        out.push_str(&self.history_block);
        out
    }
}

#[derive(Clone)]
pub struct ContextAssembler {
    store: Arc<dyn DataStore>,
    history_turns: usize,
    private_document_char_cap: usize,
}

impl std::fmt::Debug for ContextAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextAssembler")
            .field("history_turns", &self.history_turns)
            .field("private_document_char_cap", &self.private_document_char_cap)
            .finish_non_exhaustive()
    }
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn DataStore>,
        history_turns: usize,
        private_document_char_cap: usize,
    ) -> Self {
        Self {
            store,
            history_turns,
            private_document_char_cap,
        }
    }

    pub fn history_turns(&self) -> usize {
        self.history_turns
    }

    pub async fn build_context(
        &self,
        user_id: &str,
        message: &str,
        history: &[TurnMessage],
        settings: &AdminSettings,
    ) -> Result<ConversationContext, Error> {
        let (global_documents, private_documents, profile) = tokio::try_join!(
            self.store.list_global_documents(),
            self.store.list_user_documents(user_id),
            self.store.get_user_profile(user_id),
        )?;

        let mut documents_block = render_global_documents(&global_documents);
        documents_block.push_str(&render_private_documents(
            &private_documents,
            message,
            self.private_document_char_cap,
        ));

        let base = settings
            .system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let mut system_prompt = render_base_prompt(base, settings, profile.as_ref());
        system_prompt.push_str(PRIORITY_INSTRUCTION);

        Ok(ConversationContext {
            system_prompt,
            documents_block,
            user_facts_block: render_user_facts(profile.as_ref()),
            history_block: render_history(recent_history(history, self.history_turns)),
            turn_input: message.to_string(),
        })
    }
}

/// The last `turns` entries of `history`
pub fn recent_history(history: &[TurnMessage], turns: usize) -> &[TurnMessage] {
    &history[history.len().saturating_sub(turns)..]
}

/// Detects extracted text that is really a leaked binary stream
pub fn looks_binary(text: &str) -> bool {
    if BINARY_MARKERS.iter().any(|marker| text.contains(marker)) {
        return true;
    }
    let mut total = 0usize;
    let mut suspicious = 0usize;
    for c in text.chars() {
        total += 1;
        if c == char::REPLACEMENT_CHARACTER || (c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            suspicious += 1;
        }
    }
    suspicious * CONTROL_CHAR_DENOMINATOR > total
}

/// Lowercased alphanumeric words of at least four characters
pub fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_KEYWORD_CHARS)
        .map(str::to_lowercase)
        .collect()
}

fn filename_stem(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    }
}

/// Whether the message shares a keyword with the document's filename
pub fn is_relevant(message_keywords: &HashSet<String>, filename: &str) -> bool {
    keywords(filename_stem(filename))
        .iter()
        .any(|word| message_keywords.contains(word))
}

/// Cuts `text` to `cap` characters, appending the truncation marker when cut
pub fn truncate_chars(text: &str, cap: usize) -> String {
    match text.char_indices().nth(cap) {
        None => text.to_string(),
        Some((byte_index, _)) => format!("{}\n{TRUNCATION_MARKER}", &text[..byte_index]),
    }
}

fn usable_text(document: &DocumentRecord) -> Option<&str> {
    document
        .extracted_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty() && !looks_binary(text))
}

fn render_global_documents(documents: &[DocumentRecord]) -> String {
    if documents.is_empty() {
        return String::new();
    }
    let mut block = String::from("\n\n## Company reference documents\n");
    for document in documents {
        let _ = write!(
            block,
            "\n### {} ({})\n",
            document.filename, document.mime_type
        );
        if let Some(text) = usable_text(document) {
            block.push_str(text);
            block.push('\n');
        }
    }
    block
}

fn render_private_documents(documents: &[DocumentRecord], message: &str, cap: usize) -> String {
    if documents.is_empty() {
        return String::new();
    }
    let message_keywords = keywords(message);
    let mut block = String::from("\n\n## Documents uploaded by this user\n");
    for document in documents {
        let _ = write!(
            block,
            "\n### {} ({})\n",
            document.filename, document.mime_type
        );
        if !is_relevant(&message_keywords, &document.filename) {
            continue;
        }
        if let Some(text) = usable_text(document) {
            block.push_str(&truncate_chars(text, cap));
            block.push('\n');
        }
    }
    block
}

fn render_history(history: &[TurnMessage]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut block = String::from("\n\n## Recent conversation\n");
    for turn in history {
        let _ = writeln!(block, "{}: {}", turn.role, turn.content);
    }
    block
}

fn render_user_facts(profile: Option<&UserProfile>) -> String {
    let Some(profile) = profile else {
        return String::new();
    };
    let facts = [
        ("Name", profile.full_name.as_deref()),
        ("Email", profile.email.as_deref()),
        ("Phone", profile.phone.as_deref()),
        ("Company", profile.company.as_deref()),
    ];
    let mut lines = String::new();
    for (label, value) in facts {
        if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
            let _ = writeln!(lines, "- {label}: {value}");
        }
    }
    if lines.is_empty() {
        return String::new();
    }
    format!("\n\n## Known facts about this user\n{lines}")
}

/// Substitutes `{{ company_name }}`, `{{ user_name }}` and `{{ current_date }}`.
///
/// Unknown variables render empty. A prompt that does not parse as a template
/// has its tags removed instead.
fn render_base_prompt(
    base: &str,
    settings: &AdminSettings,
    profile: Option<&UserProfile>,
) -> String {
    let company_name = non_blank(settings.company_name.as_deref()).unwrap_or("our company");
    let user_name = non_blank(profile.and_then(|p| p.full_name.as_deref())).unwrap_or("there");
    let current_date = Utc::now().format("%B %-d, %Y").to_string();

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    match env.render_str(
        base,
        context! { company_name, user_name, current_date },
    ) {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!("System prompt is not a valid template, stripping placeholders: {e}");
            TEMPLATE_TAG.replace_all(base, "").into_owned()
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
