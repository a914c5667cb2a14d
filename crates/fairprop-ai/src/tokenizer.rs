//! Text normalization and WordPiece encoding into fixed-window token ids.
//!
//! The normalization rules, special tokens, and window size all come from the
//! artifact metadata, so the encoder reproduces exactly what the vocabulary was
//! built against. Output is always framed as `[CLS] content… [SEP]`.

use std::collections::HashMap;
use std::path::Path;

use fairprop_core::metadata::MIN_SEQUENCE_LENGTH;
use fairprop_core::{
    ArtifactLoadError, ArtifactMetadata, EncodedInput, EncodingError, Normalization,
    TruncationPolicy,
};

/// Words longer than this are mapped straight to the unknown token.
const MAX_WORD_CHARS: usize = 100;

const CONTINUATION_PREFIX: &str = "##";

/// Token table of a WordPiece vocabulary; ids are line indices of `vocab.txt`.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(tokens.len());
        for (id, token) in tokens.iter().enumerate() {
            index.entry(token.clone()).or_insert(id as u32);
        }
        Self { tokens, index }
    }

    /// Load a `vocab.txt` file, one token per line.
    pub fn load(path: &Path) -> Result<Self, ArtifactLoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ArtifactLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let vocab = Self::from_tokens(raw.lines().map(|l| l.trim_end_matches('\r')));
        if vocab.is_empty() {
            return Err(ArtifactLoadError::Invalid(format!(
                "vocabulary {} is empty",
                path.display()
            )));
        }
        Ok(vocab)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn id(&self, token: &str) -> Option<u32> {
        self.index.get(token).copied()
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Greedy longest-match-first split of one word. `None` if any remainder is unmatched.
    fn split_word(&self, word: &str) -> Option<Vec<u32>> {
        if word.chars().count() > MAX_WORD_CHARS {
            return None;
        }

        let mut pieces = Vec::new();
        let mut start = 0;
        while start < word.len() {
            let mut end = word.len();
            let mut matched = None;
            while end > start {
                let piece = &word[start..end];
                let id = if start == 0 {
                    self.id(piece)
                } else {
                    self.id(&format!("{CONTINUATION_PREFIX}{piece}"))
                };
                if id.is_some() {
                    matched = id;
                    break;
                }
                end = word[..end]
                    .char_indices()
                    .next_back()
                    .map_or(start, |(i, _)| i);
            }
            pieces.push(matched?);
            start = end;
        }
        Some(pieces)
    }
}

/// Per-call encoding knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    pub truncation: TruncationPolicy,
    /// Stricter window than the artifact's, e.g. while serving degraded.
    pub cap: Option<usize>,
}

enum Splitter {
    WordPiece(Vocabulary),
    #[cfg(feature = "onnx")]
    HuggingFace(Box<tokenizers::Tokenizer>),
}

/// Turns raw text into a bounded [`EncodedInput`]. Pure and deterministic.
pub struct TextEncoder {
    splitter: Splitter,
    normalization: Normalization,
    cls: u32,
    sep: u32,
    pad: u32,
    unk: Option<u32>,
    max_sequence_length: usize,
    vocab_size: usize,
}

impl TextEncoder {
    /// Build a WordPiece encoder for the given artifact metadata.
    pub fn wordpiece(
        vocab: Vocabulary,
        metadata: &ArtifactMetadata,
    ) -> Result<Self, ArtifactLoadError> {
        let specials = &metadata.special_tokens;
        let required = |token: &str| {
            vocab.id(token).ok_or_else(|| {
                ArtifactLoadError::Invalid(format!("vocabulary is missing special token {token:?}"))
            })
        };
        let cls = required(&specials.cls)?;
        let sep = required(&specials.sep)?;
        let pad = vocab.id(&specials.pad).unwrap_or(0);
        let unk = vocab.id(&specials.unk);

        Ok(Self {
            vocab_size: vocab.len(),
            splitter: Splitter::WordPiece(vocab),
            normalization: metadata.normalization,
            cls,
            sep,
            pad,
            unk,
            max_sequence_length: metadata.max_sequence_length,
        })
    }

    /// Wrap a Hugging Face `tokenizer.json`; framing and truncation stay under our control.
    #[cfg(feature = "onnx")]
    pub fn huggingface(
        mut tokenizer: tokenizers::Tokenizer,
        metadata: &ArtifactMetadata,
    ) -> Result<Self, ArtifactLoadError> {
        tokenizer
            .with_truncation(None)
            .map_err(|e| ArtifactLoadError::Invalid(format!("disable truncation: {e}")))?;
        tokenizer.with_padding(None);

        let specials = &metadata.special_tokens;
        let required = |token: &str| {
            tokenizer.token_to_id(token).ok_or_else(|| {
                ArtifactLoadError::Invalid(format!("tokenizer is missing special token {token:?}"))
            })
        };
        let cls = required(&specials.cls)?;
        let sep = required(&specials.sep)?;
        let pad = tokenizer.token_to_id(&specials.pad).unwrap_or(0);
        let unk = tokenizer.token_to_id(&specials.unk);

        Ok(Self {
            vocab_size: tokenizer.get_vocab_size(true),
            splitter: Splitter::HuggingFace(Box::new(tokenizer)),
            normalization: metadata.normalization,
            cls,
            sep,
            pad,
            unk,
            max_sequence_length: metadata.max_sequence_length,
        })
    }

    pub fn max_sequence_length(&self) -> usize {
        self.max_sequence_length
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn pad_id(&self) -> u32 {
        self.pad
    }

    /// Encode with head truncation at the artifact window.
    pub fn encode(&self, text: &str) -> Result<EncodedInput, EncodingError> {
        self.encode_with(text, EncodeOptions::default())
    }

    /// Encode raw bytes, rejecting sequences that are not UTF-8.
    pub fn encode_bytes(
        &self,
        bytes: &[u8],
        options: EncodeOptions,
    ) -> Result<EncodedInput, EncodingError> {
        let text = std::str::from_utf8(bytes).map_err(|e| EncodingError::InvalidUtf8 {
            valid_up_to: e.valid_up_to(),
        })?;
        self.encode_with(text, options)
    }

    pub fn encode_with(
        &self,
        text: &str,
        options: EncodeOptions,
    ) -> Result<EncodedInput, EncodingError> {
        let window = options
            .cap
            .map_or(self.max_sequence_length, |cap| {
                cap.min(self.max_sequence_length)
            })
            .max(MIN_SEQUENCE_LENGTH);
        let keep = window - 2;

        let normalized = normalize(text, &self.normalization);

        // Head truncation can stop one token past the window.
        let limit = match options.truncation {
            TruncationPolicy::Head => Some(keep + 1),
            TruncationPolicy::Tail => None,
        };
        let mut content = self.split(&normalized, limit)?;
        let truncated = options.truncation.truncate(&mut content, keep);

        let mut ids = Vec::with_capacity(content.len() + 2);
        ids.push(self.cls);
        ids.extend(content);
        ids.push(self.sep);
        Ok(EncodedInput::new(ids, truncated))
    }

    fn split(&self, text: &str, limit: Option<usize>) -> Result<Vec<u32>, EncodingError> {
        match &self.splitter {
            Splitter::WordPiece(vocab) => {
                let mut ids = Vec::new();
                for word in pre_tokenize(text) {
                    if limit.is_some_and(|l| ids.len() >= l) {
                        break;
                    }
                    match (vocab.split_word(word), self.unk) {
                        (Some(pieces), _) => ids.extend(pieces),
                        (None, Some(unk)) => ids.push(unk),
                        (None, None) => {
                            return Err(EncodingError::Unrepresentable {
                                word: word.to_string(),
                            });
                        }
                    }
                }
                Ok(ids)
            }
            #[cfg(feature = "onnx")]
            Splitter::HuggingFace(tokenizer) => {
                let encoding = tokenizer
                    .encode(text, false)
                    .map_err(|e| EncodingError::Tokenizer(e.to_string()))?;
                Ok(encoding.get_ids().to_vec())
            }
        }
    }
}

/// Apply the artifact's normalization rules.
pub fn normalize(text: &str, rules: &Normalization) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;

    for ch in text.chars() {
        if rules.strip_control && ch.is_control() && !ch.is_whitespace() {
            continue;
        }
        if rules.collapse_whitespace && ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if rules.lowercase {
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Whitespace split with punctuation isolated into single-character words.
fn pre_tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace().flat_map(split_punctuation)
}

fn split_punctuation(chunk: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut start = 0;
    for (i, ch) in chunk.char_indices() {
        if is_punctuation(ch) {
            if start < i {
                words.push(&chunk[start..i]);
            }
            let end = i + ch.len_utf8();
            words.push(&chunk[i..end]);
            start = end;
        }
    }
    if start < chunk.len() {
        words.push(&chunk[start..]);
    }
    words
}

fn is_punctuation(ch: char) -> bool {
    ch.is_ascii_punctuation() || !(ch.is_alphanumeric() || ch.is_whitespace() || ch.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(max_len: usize) -> ArtifactMetadata {
        let mut meta = ArtifactMetadata::from_json(
            r#"{"artifact_version": "1.0.0", "max_sequence_length": 16}"#,
        )
        .unwrap();
        meta.max_sequence_length = max_len;
        meta
    }

    fn vocab() -> Vocabulary {
        Vocabulary::from_tokens([
            "[PAD]", "[UNK]", "[CLS]", "[SEP]", "no", "kids", "allowed", "school", "##s", "great",
            "-", "family", "friendly", "un", "##der",
        ])
    }

    fn encoder(max_len: usize) -> TextEncoder {
        TextEncoder::wordpiece(vocab(), &metadata(max_len)).unwrap()
    }

    #[test]
    fn normalize_collapses_and_lowercases() {
        let rules = Normalization::default();
        assert_eq!(normalize("  No\tKIDS \n\n allowed ", &rules), "no kids allowed");
        assert_eq!(normalize("a\u{0007}b", &rules), "ab");
        assert_eq!(normalize("", &rules), "");
    }

    #[test]
    fn normalize_respects_disabled_rules() {
        let rules = Normalization {
            lowercase: false,
            collapse_whitespace: false,
            strip_control: false,
        };
        assert_eq!(normalize(" A  B ", &rules), " A  B ");
    }

    #[test]
    fn punctuation_is_isolated() {
        let words: Vec<&str> = pre_tokenize("family-friendly, great!").collect();
        assert_eq!(words, vec!["family", "-", "friendly", ",", "great", "!"]);
    }

    #[test]
    fn encode_frames_with_specials() {
        let enc = encoder(16);
        let input = enc.encode("No kids allowed").unwrap();
        assert_eq!(input.ids(), &[2, 4, 5, 6, 3]);
        assert_eq!(input.attention_mask().len(), input.len());
        assert!(!input.is_truncated());
    }

    #[test]
    fn wordpiece_uses_continuations() {
        let enc = encoder(16);
        let input = enc.encode("schools under").unwrap();
        // school ##s un ##der
        assert_eq!(input.ids(), &[2, 7, 8, 13, 14, 3]);
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let enc = encoder(16);
        let input = enc.encode("no pets").unwrap();
        assert_eq!(input.ids(), &[2, 4, 1, 3]);
    }

    #[test]
    fn unrepresentable_without_unk_is_an_error() {
        let vocab = Vocabulary::from_tokens(["[CLS]", "[SEP]", "no"]);
        let enc = TextEncoder::wordpiece(vocab, &metadata(16)).unwrap();
        assert!(enc.encode("no").is_ok());
        assert_eq!(
            enc.encode("no pets"),
            Err(EncodingError::Unrepresentable {
                word: "pets".into()
            })
        );
    }

    #[test]
    fn empty_text_is_minimal_encoding() {
        let enc = encoder(16);
        let input = enc.encode("").unwrap();
        assert_eq!(input.ids(), &[2, 3]);
        assert!(!input.is_truncated());

        let blank = enc.encode(" \n\t ").unwrap();
        assert_eq!(blank, input);
    }

    #[test]
    fn encode_is_deterministic() {
        let enc = encoder(16);
        let text = "Great schools, family-friendly";
        assert_eq!(enc.encode(text).unwrap(), enc.encode(text).unwrap());
    }

    #[test]
    fn head_truncation_keeps_first_tokens() {
        let enc = encoder(5);
        let input = enc.encode("no kids allowed great school").unwrap();
        assert_eq!(input.ids(), &[2, 4, 5, 6, 3]);
        assert!(input.is_truncated());
    }

    #[test]
    fn tail_truncation_keeps_last_tokens() {
        let enc = encoder(5);
        let options = EncodeOptions {
            truncation: TruncationPolicy::Tail,
            cap: None,
        };
        let input = enc
            .encode_with("no kids allowed great school", options)
            .unwrap();
        assert_eq!(input.ids(), &[2, 6, 9, 7, 3]);
        assert!(input.is_truncated());
    }

    #[test]
    fn exact_fit_is_not_truncated() {
        let enc = encoder(5);
        let input = enc.encode("no kids allowed").unwrap();
        assert_eq!(input.len(), 5);
        assert!(!input.is_truncated());
    }

    #[test]
    fn cap_only_tightens_the_window() {
        let enc = encoder(8);
        let capped = EncodeOptions {
            cap: Some(4),
            ..Default::default()
        };
        let input = enc.encode_with("no kids allowed", capped).unwrap();
        assert_eq!(input.len(), 4);
        assert!(input.is_truncated());

        let loose = EncodeOptions {
            cap: Some(1_000),
            ..Default::default()
        };
        let input = enc.encode_with("no kids allowed", loose).unwrap();
        assert_eq!(input.len(), 5);
        assert!(!input.is_truncated());
    }

    #[test]
    fn long_input_never_exceeds_window() {
        let enc = encoder(64);
        let text = "no kids ".repeat(5_000);
        let input = enc.encode(&text).unwrap();
        assert_eq!(input.len(), 64);
        assert!(input.is_truncated());
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() {
        let enc = encoder(16);
        let err = enc
            .encode_bytes(b"no \xff kids", EncodeOptions::default())
            .unwrap_err();
        assert_eq!(err, EncodingError::InvalidUtf8 { valid_up_to: 3 });
        assert!(enc.encode_bytes(b"no kids", EncodeOptions::default()).is_ok());
    }

    #[test]
    fn missing_cls_rejects_vocabulary() {
        let vocab = Vocabulary::from_tokens(["[SEP]", "no"]);
        assert!(TextEncoder::wordpiece(vocab, &metadata(16)).is_err());
    }

    #[test]
    fn vocabulary_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        std::fs::write(&path, "[PAD]\r\n[UNK]\n[CLS]\n[SEP]\nhome\n").unwrap();
        let vocab = Vocabulary::load(&path).unwrap();
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.id("[PAD]"), Some(0));
        assert_eq!(vocab.id("home"), Some(4));
        assert_eq!(vocab.token(2), Some("[CLS]"));
    }
}
