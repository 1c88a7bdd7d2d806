use std::cmp::Reverse;
use std::fs;
use std::path::Path;

use ahash::{AHashMap, AHashSet};
use compact_str::{format_compact, CompactString};
use dary_heap::OctonaryHeap;
use fancy_regex::Regex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Segmentation pattern for word-scoped encoding: one match per
/// whitespace-delimited word. Merges never cross match boundaries.
const WORD_PATTERN: &str = r"\S+";

/// Version tag written into every persisted model artifact.
/// Bump when the artifact layout changes; `load` rejects anything else.
const ARTIFACT_VERSION: u32 = 1;

/// Above this many symbols the merge loop switches from linear scan to a
/// heap over the symbol list. Short words are faster without the heap.
const MERGE_LINEAR_MAX: usize = 32;

type Pair = (u32, u32);

const NONE: u32 = u32::MAX;
const NO_RANK: u32 = u32::MAX;

// ========================= Errors =========================

/// Failures surfaced by the tokenizer engine.
///
/// `tokenize` never returns these: out-of-vocabulary content degrades to the
/// configured unknown token instead. Everything else propagates.
#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("token index {index} out of range for vocabulary of {vocab_size} entries")]
    IndexOutOfRange { index: u32, vocab_size: usize },

    #[error("token {token:?} is not in the vocabulary")]
    UnknownToken { token: String },

    /// Wraps the failing element's error with its position in the input,
    /// so batch callers can tell which entry was bad.
    #[error("batch element {position}: {source}")]
    BatchElement {
        position: usize,
        #[source]
        source: Box<TokenizerError>,
    },

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("corrupt model artifact: {0}")]
    CorruptModel(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TokenizerError>;

fn at_position(position: usize) -> impl Fn(TokenizerError) -> TokenizerError {
    move |source| TokenizerError::BatchElement {
        position,
        source: Box::new(source),
    }
}

// ========================= Configuration =========================

/// Which end of a sequence padding or truncation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Leading,
    Trailing,
}

/// How encoded symbols record word boundaries, so `detokenize` can
/// reconstruct spacing.
///
/// `Suffix`: an end-of-word symbol is appended to every word's symbol
/// sequence and travels through merges (`"g" + "</w>" -> "g</w>"`).
/// `Prefix`: the marker is glued onto each word's first symbol
/// (`"##" + "a" -> "##a"`), so marker-bearing tokens open a new word.
/// `None`: boundaries are not recorded and decoding concatenates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryMarker {
    Suffix(CompactString),
    Prefix(CompactString),
    None,
}

/// Model options fixed at construction time. All policy lives here; no
/// per-call switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Substituted for any symbol that cannot be resolved to a vocabulary
    /// entry. Must itself be in the vocabulary.
    pub unknown_token: CompactString,
    /// Fill token for `pad_sequences`. Must be in the vocabulary.
    pub pad_token: CompactString,
    pub lowercase: bool,
    pub collapse_whitespace: bool,
    /// Insert a separator at letter/digit <-> punctuation boundaries during
    /// normalization, so punctuation runs form their own words.
    pub isolate_punctuation: bool,
    pub boundary_marker: BoundaryMarker,
    /// When true, merges are scoped to whitespace-delimited words. When
    /// false the whole normalized text is one symbol stream and whitespace
    /// characters are ordinary symbols.
    pub word_split: bool,
    pub pad_side: Side,
    pub truncate_side: Side,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            unknown_token: CompactString::const_new("<unk>"),
            pad_token: CompactString::const_new("<pad>"),
            lowercase: true,
            collapse_whitespace: true,
            isolate_punctuation: false,
            boundary_marker: BoundaryMarker::Suffix(CompactString::const_new("</w>")),
            word_split: true,
            pad_side: Side::Trailing,
            truncate_side: Side::Trailing,
        }
    }
}

// ========================= Text normalization =========================

/// Normalize text with the default configuration (NFC, lowercase, collapse
/// whitespace). Standalone form of [`Tokenizer::clean_text`].
pub fn clean_text(text: &str) -> String {
    clean_text_with(text, &TokenizerConfig::default())
}

/// Normalize text per `config`: Unicode NFC, then optional lowercasing,
/// punctuation isolation and whitespace collapsing, in that order.
///
/// Idempotent: applying it twice yields the same string as applying it once.
pub fn clean_text_with(text: &str, config: &TokenizerConfig) -> String {
    let mut out: String = text.nfc().collect();
    if config.lowercase {
        out = out.to_lowercase();
    }
    if config.isolate_punctuation {
        out = isolate_punctuation(&out);
    }
    if config.collapse_whitespace {
        out = out.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    out
}

fn is_punctuation(c: char) -> bool {
    !c.is_alphanumeric() && !c.is_whitespace()
}

/// Insert exactly one space wherever a letter/digit run meets a punctuation
/// run. Boundaries that already carry whitespace are left alone, which is
/// what makes the pass idempotent.
fn isolate_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if let Some(p) = prev {
            if !p.is_whitespace() && !c.is_whitespace() && is_punctuation(p) != is_punctuation(c)
            {
                out.push(' ');
            }
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

// ========================= Vocabulary store =========================

/// Bijection between token strings and dense indices `[0, len)`.
/// Index = position in the ordered token list the store was built from.
#[derive(Debug, Clone)]
struct Vocabulary {
    tokens: Vec<CompactString>,
    index: AHashMap<CompactString, u32>,
}

impl Vocabulary {
    fn from_tokens(tokens: Vec<CompactString>) -> Result<Self> {
        let mut index = AHashMap::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            let i = u32::try_from(i).map_err(|_| {
                TokenizerError::InvalidModel(format!("vocabulary index {i} exceeds u32 range"))
            })?;
            if index.insert(token.clone(), i).is_some() {
                return Err(TokenizerError::InvalidModel(format!(
                    "duplicate vocabulary token {token:?}"
                )));
            }
        }
        Ok(Self { tokens, index })
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }

    fn token(&self, index: u32) -> Result<&str> {
        self.tokens
            .get(index as usize)
            .map(CompactString::as_str)
            .ok_or(TokenizerError::IndexOutOfRange {
                index,
                vocab_size: self.tokens.len(),
            })
    }

    fn index(&self, token: &str) -> Result<u32> {
        self.index_of(token)
            .ok_or_else(|| TokenizerError::UnknownToken {
                token: token.to_string(),
            })
    }

    fn index_of(&self, token: &str) -> Option<u32> {
        self.index.get(token).copied()
    }
}

// ========================= Merge rule table =========================

/// One learned merge: two adjacent symbols and the symbol they fuse into.
/// Rank (priority) is the rule's position in the ordered list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRule {
    pub left: CompactString,
    pub right: CompactString,
    pub merged: CompactString,
}

impl MergeRule {
    pub fn new(
        left: impl Into<CompactString>,
        right: impl Into<CompactString>,
        merged: impl Into<CompactString>,
    ) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
            merged: merged.into(),
        }
    }
}

/// Rank-ordered merge rules with an interned symbol space for pair lookup.
///
/// Symbols are interned to `u32` ids so the encoder's inner loop compares
/// and hashes fixed-width ids instead of strings. `pairs` maps an adjacent
/// id pair to `(rank, merged id)`; on duplicate pairs the earliest rank
/// wins, matching the rule order the model was trained with.
#[derive(Debug, Clone)]
struct MergeTable {
    rules: Vec<MergeRule>,
    symbols: Vec<CompactString>,
    symbol_ids: AHashMap<CompactString, u32>,
    pairs: AHashMap<Pair, (u32, u32)>,
}

impl MergeTable {
    /// Build and validate the table. Every rule input must be resolvable:
    /// atomic under the boundary-marker policy, or produced by an earlier
    /// rule. Anything else can never appear in a working sequence, so a
    /// model that references it is broken.
    fn build(rules: Vec<MergeRule>, marker: &BoundaryMarker) -> Result<Self> {
        let mut table = Self {
            rules: Vec::new(),
            symbols: Vec::new(),
            symbol_ids: AHashMap::new(),
            pairs: AHashMap::new(),
        };
        let mut produced: AHashSet<CompactString> = AHashSet::new();

        for (rank, rule) in rules.iter().enumerate() {
            for sym in [&rule.left, &rule.right] {
                if !is_atomic(sym, marker) && !produced.contains(sym) {
                    return Err(TokenizerError::InvalidModel(format!(
                        "merge rule {rank} references unresolvable symbol {sym:?}"
                    )));
                }
            }
            let rank = u32::try_from(rank).map_err(|_| {
                TokenizerError::InvalidModel(format!("merge rank {rank} exceeds u32 range"))
            })?;
            let left = table.intern(&rule.left);
            let right = table.intern(&rule.right);
            let merged = table.intern(&rule.merged);
            table.pairs.entry((left, right)).or_insert((rank, merged));
            produced.insert(rule.merged.clone());
        }

        table.rules = rules;
        Ok(table)
    }

    fn intern(&mut self, sym: &CompactString) -> u32 {
        if let Some(&id) = self.symbol_ids.get(sym) {
            return id;
        }
        let id = self.symbols.len() as u32;
        self.symbols.push(sym.clone());
        self.symbol_ids.insert(sym.clone(), id);
        id
    }

    fn len(&self) -> usize {
        self.rules.len()
    }

    fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    fn symbol_id(&self, text: &str) -> Option<u32> {
        self.symbol_ids.get(text).copied()
    }

    fn symbol(&self, id: u32) -> &str {
        &self.symbols[id as usize]
    }

    fn pair_merge(&self, left: u32, right: u32) -> Option<(u32, u32)> {
        self.pairs.get(&(left, right)).copied()
    }

    fn pair_rank(&self, left: u32, right: u32) -> u32 {
        self.pairs.get(&(left, right)).map_or(NO_RANK, |&(r, _)| r)
    }
}

/// A symbol is atomic when a working sequence can start with it: a single
/// character, the suffix marker itself, or marker + single character under
/// a prefix marker.
fn is_atomic(sym: &CompactString, marker: &BoundaryMarker) -> bool {
    if single_char(sym) {
        return true;
    }
    match marker {
        BoundaryMarker::Suffix(m) => sym == m,
        BoundaryMarker::Prefix(m) => sym.strip_prefix(m.as_str()).is_some_and(single_char),
        BoundaryMarker::None => false,
    }
}

fn single_char(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some() && chars.next().is_none()
}

// ========================= Merge loop =========================

/// Per-call symbol space: the table's interned ids extended with ids for
/// atoms the table has never seen. Extended ids can never match a merge
/// pair, so they pass through the loop untouched.
struct SymbolSpace<'a> {
    table: &'a MergeTable,
    extra: Vec<CompactString>,
}

impl<'a> SymbolSpace<'a> {
    fn new(table: &'a MergeTable) -> Self {
        Self {
            table,
            extra: Vec::new(),
        }
    }

    fn resolve(&mut self, text: &str) -> u32 {
        if let Some(id) = self.table.symbol_id(text) {
            return id;
        }
        let id = self.table.symbol_count() + self.extra.len();
        self.extra.push(CompactString::from(text));
        id as u32
    }

    fn text(&self, id: u32) -> &str {
        let base = self.table.symbol_count();
        if (id as usize) < base {
            self.table.symbol(id)
        } else {
            &self.extra[id as usize - base]
        }
    }
}

/// Node in the flat doubly-linked list the merge loop runs over. `rank`
/// caches the rank of fusing this node with its successor (`NO_RANK` when
/// no rule applies). List order always equals ascending slot order: merges
/// keep the left slot and unlink the right one.
struct SymNode {
    sym: u32,
    rank: u32,
    prev: u32,
    next: u32,
}

fn build_nodes(ids: &[u32], space: &SymbolSpace) -> Vec<SymNode> {
    let n = ids.len();
    let mut nodes: Vec<SymNode> = ids
        .iter()
        .enumerate()
        .map(|(i, &sym)| SymNode {
            sym,
            rank: NO_RANK,
            prev: if i > 0 { (i - 1) as u32 } else { NONE },
            next: if i + 1 < n { (i + 1) as u32 } else { NONE },
        })
        .collect();
    for i in 0..n.saturating_sub(1) {
        nodes[i].rank = space.table.pair_rank(nodes[i].sym, nodes[i + 1].sym);
    }
    nodes
}

fn refresh_rank(nodes: &mut [SymNode], i: usize, space: &SymbolSpace) {
    let j = nodes[i].next;
    nodes[i].rank = if j == NONE {
        NO_RANK
    } else {
        space.table.pair_rank(nodes[i].sym, nodes[j as usize].sym)
    };
}

/// Fuse node `i` with its successor. Returns false when no rule covers the
/// pair (stale bookkeeping); the caller skips it.
fn fuse(nodes: &mut [SymNode], i: usize, space: &SymbolSpace) -> bool {
    let j = nodes[i].next as usize;
    let Some((_, merged)) = space.table.pair_merge(nodes[i].sym, nodes[j].sym) else {
        return false;
    };
    nodes[i].sym = merged;
    let j_next = nodes[j].next;
    nodes[i].next = j_next;
    if j_next != NONE {
        nodes[j_next as usize].prev = i as u32;
    }
    nodes[j].rank = NO_RANK;
    true
}

fn collect_symbols(nodes: &[SymNode]) -> Vec<u32> {
    let mut out = Vec::with_capacity(nodes.len());
    let mut cur = 0u32;
    while cur != NONE {
        out.push(nodes[cur as usize].sym);
        cur = nodes[cur as usize].next;
    }
    out
}

/// Apply merge rules until none fits: always the lowest-ranked rule among
/// the pairs currently present, leftmost occurrence first. This is not a
/// single left-to-right pass; after every fusion the surviving neighbours
/// are re-examined.
fn merge_symbols(ids: Vec<u32>, space: &SymbolSpace) -> Vec<u32> {
    if ids.len() < 2 {
        return ids;
    }
    if ids.len() <= MERGE_LINEAR_MAX {
        merge_linear(ids, space)
    } else {
        merge_heap(ids, space)
    }
}

fn merge_linear(ids: Vec<u32>, space: &SymbolSpace) -> Vec<u32> {
    let mut nodes = build_nodes(&ids, space);

    loop {
        // Leftmost live node with the minimum rank.
        let mut best: (u32, u32) = (NO_RANK, NONE);
        let mut cur = 0u32;
        while cur != NONE {
            let node = &nodes[cur as usize];
            if node.rank < best.0 {
                best = (node.rank, cur);
            }
            cur = node.next;
        }
        if best.0 == NO_RANK {
            break;
        }

        let i = best.1 as usize;
        if !fuse(&mut nodes, i, space) {
            break;
        }
        refresh_rank(&mut nodes, i, space);
        let pred = nodes[i].prev;
        if pred != NONE {
            refresh_rank(&mut nodes, pred as usize, space);
        }
    }

    collect_symbols(&nodes)
}

/// Same contract as `merge_linear`, with the minimum maintained in a heap.
/// Entries are `(rank, slot)`, so ties resolve to the lower slot — the
/// leftmost occurrence — exactly as the linear scan does. Stale entries
/// are recognized by a rank mismatch against the node and dropped.
fn merge_heap(ids: Vec<u32>, space: &SymbolSpace) -> Vec<u32> {
    let mut nodes = build_nodes(&ids, space);

    let mut heap: OctonaryHeap<Reverse<(u32, u32)>> = OctonaryHeap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if node.rank != NO_RANK {
            heap.push(Reverse((node.rank, i as u32)));
        }
    }

    while let Some(Reverse((rank, slot))) = heap.pop() {
        let i = slot as usize;
        if nodes[i].rank != rank {
            continue;
        }
        if !fuse(&mut nodes, i, space) {
            continue;
        }

        refresh_rank(&mut nodes, i, space);
        if nodes[i].rank != NO_RANK {
            heap.push(Reverse((nodes[i].rank, slot)));
        }
        let pred = nodes[i].prev;
        if pred != NONE {
            refresh_rank(&mut nodes, pred as usize, space);
            if nodes[pred as usize].rank != NO_RANK {
                heap.push(Reverse((nodes[pred as usize].rank, pred)));
            }
        }
    }

    collect_symbols(&nodes)
}

// ========================= Tokenizer =========================

/// A trained BPE model: vocabulary, rank-ordered merge rules and fixed
/// configuration. Immutable after construction; all read operations take
/// `&self` and are safe to call concurrently.
#[derive(Debug)]
pub struct Tokenizer {
    vocab: Vocabulary,
    merges: MergeTable,
    config: TokenizerConfig,
    compiled_pattern: Regex,
    unk_index: u32,
    pad_index: u32,
}

impl Tokenizer {
    /// Build a tokenizer from an index-ordered vocabulary, a rank-ordered
    /// merge-rule list and a configuration.
    ///
    /// Fails with `InvalidModel` when the vocabulary has duplicates, the
    /// configured unknown/pad tokens are missing from it, or a merge rule
    /// references a symbol no earlier rule (and no atom) can produce.
    pub fn new(
        vocabulary: Vec<String>,
        merge_rules: Vec<MergeRule>,
        config: TokenizerConfig,
    ) -> Result<Self> {
        Self::from_parts(
            vocabulary.into_iter().map(CompactString::from).collect(),
            merge_rules,
            config,
        )
    }

    fn from_parts(
        tokens: Vec<CompactString>,
        merge_rules: Vec<MergeRule>,
        config: TokenizerConfig,
    ) -> Result<Self> {
        let vocab = Vocabulary::from_tokens(tokens)?;
        let unk_index = vocab.index_of(&config.unknown_token).ok_or_else(|| {
            TokenizerError::InvalidModel(format!(
                "unknown token {:?} missing from vocabulary",
                config.unknown_token
            ))
        })?;
        let pad_index = vocab.index_of(&config.pad_token).ok_or_else(|| {
            TokenizerError::InvalidModel(format!(
                "pad token {:?} missing from vocabulary",
                config.pad_token
            ))
        })?;
        let merges = MergeTable::build(merge_rules, &config.boundary_marker)?;
        let compiled_pattern = Regex::new(WORD_PATTERN).expect("word pattern must compile");

        log::debug!(
            "tokenizer ready: {} tokens, {} merge rules",
            vocab.len(),
            merges.len()
        );

        Ok(Self {
            vocab,
            merges,
            config,
            compiled_pattern,
            unk_index,
            pad_index,
        })
    }

    // -- Lookup --

    /// Token string at `index`.
    pub fn get_token(&self, index: u32) -> Result<&str> {
        self.vocab.token(index)
    }

    /// Index of `token`.
    pub fn get_index(&self, token: &str) -> Result<u32> {
        self.vocab.index(token)
    }

    /// Element-wise [`get_token`](Self::get_token), order-preserving.
    /// Fails at the first invalid index, naming its position.
    pub fn get_tokens(&self, indices: &[u32]) -> Result<Vec<String>> {
        indices
            .iter()
            .enumerate()
            .map(|(pos, &index)| {
                self.vocab
                    .token(index)
                    .map(String::from)
                    .map_err(at_position(pos))
            })
            .collect()
    }

    /// Element-wise [`get_index`](Self::get_index), order-preserving.
    /// Fails at the first unknown token, naming its position.
    pub fn get_indices<S: AsRef<str>>(&self, tokens: &[S]) -> Result<Vec<u32>> {
        tokens
            .iter()
            .enumerate()
            .map(|(pos, token)| self.vocab.index(token.as_ref()).map_err(at_position(pos)))
            .collect()
    }

    /// Full vocabulary in index order.
    pub fn vocabulary(&self) -> &[CompactString] {
        &self.vocab.tokens
    }

    /// Full merge-rule list in rank order.
    pub fn merge_rules(&self) -> &[MergeRule] {
        &self.merges.rules
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    /// Index substituted for out-of-vocabulary symbols.
    pub fn unknown_index(&self) -> u32 {
        self.unk_index
    }

    /// Index used to fill padded sequences.
    pub fn pad_index(&self) -> u32 {
        self.pad_index
    }

    // -- Normalization --

    /// [`clean_text_with`] under this instance's configuration. Applied
    /// implicitly as the first step of [`tokenize`](Self::tokenize).
    pub fn clean_text(&self, text: &str) -> String {
        clean_text_with(text, &self.config)
    }

    // -- Encoding --

    /// Encode text into vocabulary indices.
    ///
    /// Normalizes, segments into words (or one stream, per configuration),
    /// runs the rank-greedy merge loop per segment and maps every surviving
    /// symbol to its index. Symbols absent from the vocabulary become the
    /// unknown index; this call never fails. Identical input and model
    /// always produce identical output.
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        let cleaned = self.clean_text(text);
        let mut out = Vec::new();
        if self.config.word_split {
            for m in self.compiled_pattern.find_iter(&cleaned) {
                let word = match m {
                    Ok(mat) => mat.as_str(),
                    Err(e) => {
                        log::warn!("tokenize: regex error, skipping segment: {e}");
                        continue;
                    }
                };
                self.encode_segment(word, true, &mut out);
            }
        } else {
            self.encode_segment(&cleaned, false, &mut out);
        }
        out
    }

    /// Encode many texts in parallel. Output order matches input order.
    pub fn tokenize_batch(&self, texts: &[String]) -> Vec<Vec<u32>> {
        texts.par_iter().map(|t| self.tokenize(t)).collect()
    }

    fn encode_segment(&self, segment: &str, mark_boundary: bool, out: &mut Vec<u32>) {
        let mut space = SymbolSpace::new(&self.merges);
        let mut buf = [0u8; 4];
        let mut ids: Vec<u32> = segment
            .chars()
            .map(|c| space.resolve(c.encode_utf8(&mut buf)))
            .collect();
        if ids.is_empty() {
            return;
        }

        if mark_boundary {
            match &self.config.boundary_marker {
                BoundaryMarker::Suffix(m) => {
                    let id = space.resolve(m.as_str());
                    ids.push(id);
                }
                BoundaryMarker::Prefix(m) => {
                    let glued = format_compact!("{}{}", m, space.text(ids[0]));
                    ids[0] = space.resolve(&glued);
                }
                BoundaryMarker::None => {}
            }
        }

        for id in merge_symbols(ids, &space) {
            out.push(
                self.vocab
                    .index_of(space.text(id))
                    .unwrap_or(self.unk_index),
            );
        }
    }

    // -- Decoding --

    /// Decode indices back into text, reversing the boundary-marker policy
    /// to reconstruct word spacing.
    ///
    /// Best-effort inverse of [`tokenize`](Self::tokenize): text lost to
    /// normalization (case folding, collapsed whitespace) is not recovered.
    /// Any index outside the vocabulary fails with `IndexOutOfRange`,
    /// wrapped with its position in the input.
    pub fn detokenize(&self, indices: &[u32]) -> Result<String> {
        let mut out = String::new();
        match &self.config.boundary_marker {
            BoundaryMarker::Suffix(m) => {
                let mut word_closed = false;
                for (pos, &index) in indices.iter().enumerate() {
                    let token = self.vocab.token(index).map_err(at_position(pos))?;
                    if word_closed {
                        out.push(' ');
                        word_closed = false;
                    }
                    match token.strip_suffix(m.as_str()) {
                        Some(head) => {
                            out.push_str(head);
                            word_closed = true;
                        }
                        None => out.push_str(token),
                    }
                }
            }
            BoundaryMarker::Prefix(m) => {
                for (pos, &index) in indices.iter().enumerate() {
                    let token = self.vocab.token(index).map_err(at_position(pos))?;
                    match token.strip_prefix(m.as_str()) {
                        Some(tail) => {
                            if !out.is_empty() {
                                out.push(' ');
                            }
                            out.push_str(tail);
                        }
                        None => out.push_str(token),
                    }
                }
            }
            BoundaryMarker::None => {
                for (pos, &index) in indices.iter().enumerate() {
                    let token = self.vocab.token(index).map_err(at_position(pos))?;
                    out.push_str(token);
                }
            }
        }
        Ok(out)
    }

    // -- Batch padding --

    /// Align sequences to exactly `max_len` entries each: longer input is
    /// truncated, shorter input filled with the pad index. Sides are fixed
    /// by configuration. Order and count are preserved; `max_len == 0`
    /// yields empty rows.
    pub fn pad_sequences(&self, sequences: &[Vec<u32>], max_len: usize) -> Vec<Vec<u32>> {
        sequences
            .iter()
            .map(|seq| {
                if seq.len() > max_len {
                    match self.config.truncate_side {
                        Side::Trailing => seq[..max_len].to_vec(),
                        Side::Leading => seq[seq.len() - max_len..].to_vec(),
                    }
                } else {
                    match self.config.pad_side {
                        Side::Trailing => {
                            let mut padded = seq.clone();
                            padded.resize(max_len, self.pad_index);
                            padded
                        }
                        Side::Leading => {
                            let mut padded = vec![self.pad_index; max_len - seq.len()];
                            padded.extend_from_slice(seq);
                            padded
                        }
                    }
                }
            })
            .collect()
    }

    // -- Persistence --

    /// Serialize the full model (vocabulary, merge rules, configuration)
    /// into a single versioned JSON artifact at `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let artifact = ModelArtifact {
            version: ARTIFACT_VERSION,
            vocabulary: self.vocab.tokens.clone(),
            merge_rules: self.merges.rules.clone(),
            config: self.config.clone(),
        };
        let json = serde_json::to_string(&artifact)
            .map_err(|e| TokenizerError::CorruptModel(format!("serialize: {e}")))?;
        fs::write(path.as_ref(), json)?;
        log::info!(
            "saved tokenizer model: {} tokens, {} merge rules -> {}",
            self.vocab.len(),
            self.merges.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Load a tokenizer from an artifact written by [`save`](Self::save).
    ///
    /// Fails with `Io` when the file is unreadable and `CorruptModel` when
    /// it is not a valid artifact: malformed JSON, an unrecognized version,
    /// or model data that does not validate (duplicate tokens, unresolvable
    /// merge rules). A loaded tokenizer behaves identically to the one that
    /// was saved.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())?;
        let artifact: ModelArtifact = serde_json::from_str(&data)
            .map_err(|e| TokenizerError::CorruptModel(format!("malformed artifact: {e}")))?;
        if artifact.version != ARTIFACT_VERSION {
            return Err(TokenizerError::CorruptModel(format!(
                "unsupported artifact version {} (expected {})",
                artifact.version, ARTIFACT_VERSION
            )));
        }
        let tokenizer =
            Self::from_parts(artifact.vocabulary, artifact.merge_rules, artifact.config).map_err(
                |e| match e {
                    TokenizerError::InvalidModel(msg) => TokenizerError::CorruptModel(msg),
                    other => other,
                },
            )?;
        log::info!(
            "loaded tokenizer model: {} tokens, {} merge rules <- {}",
            tokenizer.vocab.len(),
            tokenizer.merges.len(),
            path.as_ref().display()
        );
        Ok(tokenizer)
    }
}

#[derive(Serialize, Deserialize)]
struct ModelArtifact {
    version: u32,
    vocabulary: Vec<CompactString>,
    merge_rules: Vec<MergeRule>,
    config: TokenizerConfig,
}

// ============================================================================
// TESTS
// ============================================================================
