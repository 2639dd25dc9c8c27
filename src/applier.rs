//! Incremental content applier: streams generated markup into the document.
//!
//! Chunks arrive from a completion stream in arbitrary sizes, often split
//! mid-tag. The applier tokenizes them against a pending buffer, tracks tag
//! depth, and the moment a top-level block element closes it converts that
//! block to document nodes and appends them through the store's serialized
//! write path, tagged with the generator's identity.
//!
//! Partial content never reaches the shared document: a block is appended
//! only once its root tag has both opened and closed, and anything still
//! open at end-of-stream is discarded.

use std::fmt;
use std::sync::Arc;

use yrs::{Text, WriteTxn};

use crate::document::{DocumentStore, Origin};

/// Tags that can root a [`StreamingBlock`] when opened at depth 0.
const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "ul", "ol", "blockquote", "pre",
];

/// Tags with no closing counterpart.
const VOID_TAGS: &[&str] = &["br", "hr", "img", "input", "meta", "link"];

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Malformed generator markup. Discards the current block only; the
/// stream and the depth stack recover for subsequent blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamParseError {
    /// A closing tag did not match the innermost open tag.
    MismatchedClose { expected: String, found: String },
    /// The stream ended with this tag still open.
    UnclosedAtEof { tag: String },
    /// The converter rejected a completed block.
    Convert(String),
}

impl fmt::Display for StreamParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MismatchedClose { expected, found } => {
                write!(f, "mismatched closing tag: expected </{expected}>, found </{found}>")
            }
            Self::UnclosedAtEof { tag } => write!(f, "stream ended with <{tag}> still open"),
            Self::Convert(msg) => write!(f, "block conversion failed: {msg}"),
        }
    }
}

impl std::error::Error for StreamParseError {}

// ─────────────────────────────────────────────────────────────────────────────
// Converter
// ─────────────────────────────────────────────────────────────────────────────

/// One document-model node produced from a completed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocNode {
    /// Block kind, the root tag name (`h1`, `p`, ...).
    pub tag: String,
    /// Flattened text content.
    pub text: String,
}

/// Markup-block to node-list conversion, pluggable per host document model.
pub trait NodeConverter: Send + Sync {
    fn convert(&self, root: &str, markup: &str) -> Result<Vec<DocNode>, StreamParseError>;
}

/// Default converter: strips tags and keeps the flattened inline text.
pub struct TextConverter;

impl NodeConverter for TextConverter {
    fn convert(&self, root: &str, markup: &str) -> Result<Vec<DocNode>, StreamParseError> {
        let mut text = String::new();
        let mut rest = markup;
        while let Some(lt) = rest.find('<') {
            text.push_str(&rest[..lt]);
            match find_tag_end(&rest[lt..]) {
                Some(gt) => rest = &rest[lt + gt + 1..],
                None => return Err(StreamParseError::Convert("unterminated tag".into())),
            }
        }
        text.push_str(rest);
        Ok(vec![DocNode {
            tag: root.to_string(),
            text: text.trim().to_string(),
        }])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Applier
// ─────────────────────────────────────────────────────────────────────────────

/// Applier configuration.
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    /// Completed blocks held back before one batched append. Empirically
    /// tuned in practice; exposed rather than hard-coded.
    pub batch_size: usize,
    /// Name of the shared text root the nodes are appended to.
    pub text_root: String,
    /// Origin identity stamped onto appended updates.
    pub agent: String,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            text_root: "content".to_string(),
            agent: "ai-assistant".to_string(),
        }
    }
}

/// End-of-stream accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplierStats {
    pub blocks_applied: u64,
    pub blocks_discarded: u64,
}

/// Parse state for the block currently being assembled.
struct StreamingBlock {
    root: String,
    markup: String,
}

/// Tokenizer events. `raw` preserves the original tag text so the
/// completed block hands the converter exactly what was streamed.
enum Event {
    Open { name: String, raw: String, terminal: bool },
    Close { name: String, raw: String },
    Text(String),
    Skip,
}

pub struct StreamingApplier {
    doc: Arc<DocumentStore>,
    converter: Box<dyn NodeConverter>,
    config: ApplierConfig,
    /// Unconsumed stream tail, possibly ending mid-tag.
    pending: String,
    /// Open tags inside the current block.
    stack: Vec<String>,
    block: Option<StreamingBlock>,
    completed: Vec<DocNode>,
    stats: ApplierStats,
}

impl StreamingApplier {
    pub fn new(doc: Arc<DocumentStore>, config: ApplierConfig) -> Self {
        Self::with_converter(doc, config, Box::new(TextConverter))
    }

    pub fn with_converter(
        doc: Arc<DocumentStore>,
        config: ApplierConfig,
        converter: Box<dyn NodeConverter>,
    ) -> Self {
        Self {
            doc,
            converter,
            config,
            pending: String::new(),
            stack: Vec::new(),
            block: None,
            completed: Vec::new(),
            stats: ApplierStats::default(),
        }
    }

    /// Feed one stream chunk; completes and batches any blocks it closes.
    pub fn push_chunk(&mut self, chunk: &str) {
        self.pending.push_str(chunk);
        for event in drain_events(&mut self.pending) {
            self.process(event);
        }
    }

    /// End of stream: flush completed blocks, discard anything left open.
    pub fn finish(&mut self) -> ApplierStats {
        if let Some(block) = self.block.take() {
            let err = StreamParseError::UnclosedAtEof { tag: block.root };
            log::warn!("applier: discarding incomplete block: {err}");
            self.stack.clear();
            self.stats.blocks_discarded += 1;
        }
        if !self.pending.trim().is_empty() {
            log::debug!("applier: discarding {} trailing bytes", self.pending.len());
        }
        self.pending.clear();
        self.flush();
        self.stats
    }

    /// Completed blocks waiting for the next batched append.
    pub fn batched(&self) -> usize {
        self.completed.len()
    }

    fn process(&mut self, event: Event) {
        match event {
            Event::Skip => {}
            Event::Text(text) => {
                if let Some(block) = &mut self.block {
                    block.markup.push_str(&text);
                }
                // Top-level text between blocks is dropped.
            }
            Event::Open { name, raw, terminal } => match &mut self.block {
                Some(block) => {
                    block.markup.push_str(&raw);
                    if !terminal {
                        self.stack.push(name);
                    }
                }
                None => {
                    if !terminal && BLOCK_TAGS.contains(&name.as_str()) {
                        self.block = Some(StreamingBlock { root: name.clone(), markup: raw });
                        self.stack.push(name);
                    } else {
                        log::debug!("applier: skipping stray <{name}> outside a block");
                    }
                }
            },
            Event::Close { name, raw } => {
                if self.block.is_none() {
                    log::debug!("applier: skipping stray </{name}> outside a block");
                    return;
                }
                match self.stack.last() {
                    Some(top) if *top == name => {
                        self.stack.pop();
                        let block = self.block.as_mut().unwrap();
                        block.markup.push_str(&raw);
                        if self.stack.is_empty() {
                            let done = self.block.take().unwrap();
                            self.complete(done);
                        }
                    }
                    top => {
                        let err = StreamParseError::MismatchedClose {
                            expected: top.cloned().unwrap_or_default(),
                            found: name,
                        };
                        log::warn!("applier: discarding block: {err}");
                        self.block = None;
                        self.stack.clear();
                        self.stats.blocks_discarded += 1;
                    }
                }
            }
        }
    }

    fn complete(&mut self, block: StreamingBlock) {
        match self.converter.convert(&block.root, &block.markup) {
            Ok(nodes) => {
                self.completed.extend(nodes);
                self.stats.blocks_applied += 1;
                if self.completed.len() >= self.config.batch_size {
                    self.flush();
                }
            }
            Err(e) => {
                log::warn!("applier: discarding block: {e}");
                self.stats.blocks_discarded += 1;
            }
        }
    }

    /// Append every batched node in one document transaction.
    fn flush(&mut self) {
        if self.completed.is_empty() {
            return;
        }
        let nodes = std::mem::take(&mut self.completed);
        let root = self.config.text_root.clone();
        let origin = Origin::synthetic(&self.config.agent);
        self.doc.apply_local(origin, |txn| {
            let text = txn.get_or_insert_text(root.as_str());
            for node in &nodes {
                let end = text.len(txn);
                text.insert(txn, end, &node.text);
                let end = text.len(txn);
                text.insert(txn, end, "\n");
            }
        });
        log::debug!("applier: appended {} node(s)", nodes.len());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokenizer
// ─────────────────────────────────────────────────────────────────────────────

/// Consume complete events from the buffer, leaving any incomplete tag
/// (or comment) tail in place for the next chunk.
fn drain_events(pending: &mut String) -> Vec<Event> {
    let buf = std::mem::take(pending);
    let mut events = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        let lt = match buf[pos..].find('<') {
            Some(rel) => pos + rel,
            None => {
                events.push(Event::Text(buf[pos..].to_string()));
                return events;
            }
        };
        if lt > pos {
            events.push(Event::Text(buf[pos..lt].to_string()));
        }

        let rest = &buf[lt..];
        if rest.len() < 2 {
            *pending = rest.to_string();
            return events;
        }

        // Comments (and a possible comment prefix at the buffer end).
        // Compare bytes: slicing the str at a fixed offset would panic on
        // a multibyte character straddling it.
        if rest.starts_with("<!") {
            if rest.len() < 4 && "<!--".as_bytes().starts_with(rest.as_bytes()) {
                *pending = rest.to_string();
                return events;
            }
            if rest.starts_with("<!--") {
                match rest.find("-->") {
                    Some(end) => {
                        events.push(Event::Skip);
                        pos = lt + end + 3;
                        continue;
                    }
                    None => {
                        *pending = rest.to_string();
                        return events;
                    }
                }
            }
            // Declarations: pass through the depth tracker untouched.
            match find_tag_end(rest) {
                Some(gt) => {
                    events.push(Event::Skip);
                    pos = lt + gt + 1;
                    continue;
                }
                None => {
                    *pending = rest.to_string();
                    return events;
                }
            }
        }

        let second = rest[1..].chars().next().unwrap();
        if !second.is_ascii_alphabetic() && second != '/' {
            // A bare '<' in text content.
            events.push(Event::Text("<".to_string()));
            pos = lt + 1;
            continue;
        }

        let gt = match find_tag_end(rest) {
            Some(gt) => gt,
            None => {
                *pending = rest.to_string();
                return events;
            }
        };
        let raw = &rest[..=gt];
        events.push(parse_tag(raw));
        pos = lt + gt + 1;
    }

    events
}

/// Offset of the `>` terminating the tag starting at `s[0] == '<'`,
/// ignoring `>` inside quoted attribute values.
fn find_tag_end(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices().skip(1) {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                '>' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

fn parse_tag(raw: &str) -> Event {
    let inner = raw[1..raw.len() - 1].trim();
    if let Some(name) = inner.strip_prefix('/') {
        let name = name.trim().to_ascii_lowercase();
        return Event::Close { name, raw: raw.to_string() };
    }

    let self_closing = inner.ends_with('/');
    let inner = inner.trim_end_matches('/').trim();
    let name: String = inner
        .chars()
        .take_while(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    if name.is_empty() {
        return Event::Skip;
    }
    let terminal = self_closing || VOID_TAGS.contains(&name.as_str());
    Event::Open { name, raw: raw.to_string(), terminal }
}
