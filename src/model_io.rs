//! Model persistence.
//!
//! `<prefix>.model` is the reloadable, line-oriented model:
//!
//! ```text
//! bpe v1
//! <split pattern, empty for no chunking>
//! <number of special tokens N>
//! <special text> <id>        (N lines, ascending id)
//! <left id> <right id>       (one line per merge rule)
//! ```
//!
//! Merge rule `k` (0-based, in file order) always gets id `256 + k`; line
//! order is the only record of rank.
//!
//! `<prefix>.vocab` is a rendering of every token for humans and is never
//! read back.

use std::{
    collections::HashMap,
    ffi::OsString,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use unicode_general_category::{GeneralCategory, get_general_category};

use crate::{
    chunker::Chunker,
    error::ModelIoError,
    tokenizer::Tokenizer,
    types::{Token, TokenPair},
    vocab::Vocabulary,
};

/// Version tag written to, and required on, the first line of a model file.
pub const MODEL_VERSION: &str = "bpe v1";

const MODEL_EXT: &str = "model";
const VOCAB_EXT: &str = "vocab";

/// Renders token bytes for display.
///
/// Invalid UTF-8 becomes U+FFFD and every character in the Unicode "Other"
/// category (control, format, private use, unassigned) is escaped as
/// `\uXXXX`, so the result is lossy.
pub fn render_token(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for ch in String::from_utf8_lossy(bytes).chars() {
        if is_other(ch) {
            out.push_str(&format!("\\u{:04x}", ch as u32));
        } else {
            out.push(ch);
        }
    }
    out
}

/// General category `C*`. Surrogates never occur in a `char`.
fn is_other(ch: char) -> bool {
    matches!(
        get_general_category(ch),
        GeneralCategory::Control
            | GeneralCategory::Format
            | GeneralCategory::PrivateUse
            | GeneralCategory::Surrogate
            | GeneralCategory::Unassigned
    )
}

/// Writes `<prefix>.model` and `<prefix>.vocab`.
///
/// # Errors
///
/// Returns [`ModelIoError::Unrepresentable`] if the split pattern contains a
/// line break, or [`ModelIoError::Io`] if either file cannot be written.
pub fn save(tokenizer: &Tokenizer, file_prefix: &Path) -> Result<(), ModelIoError> {
    let pattern = tokenizer.pattern();
    if pattern.contains(['\n', '\r']) {
        return Err(ModelIoError::Unrepresentable(format!(
            "split pattern contains a line break: {pattern:?}"
        )));
    }

    let vocab = tokenizer.vocabulary();
    let specials = sorted_specials(vocab.special_tokens());

    let model_path = with_suffix(file_prefix, MODEL_EXT);
    let mut w = BufWriter::new(File::create(&model_path)?);
    writeln!(w, "{MODEL_VERSION}")?;
    writeln!(w, "{pattern}")?;
    writeln!(w, "{}", specials.len())?;
    for (text, id) in &specials {
        writeln!(w, "{text} {id}")?;
    }
    for (pair, _) in vocab.merges() {
        writeln!(w, "{} {}", pair.0, pair.1)?;
    }
    w.flush()?;

    let vocab_path = with_suffix(file_prefix, VOCAB_EXT);
    let mut w = BufWriter::new(File::create(&vocab_path)?);
    write_vocab(&mut w, vocab)?;
    w.flush()?;

    log::debug!(
        "saved {} merges and {} special tokens to {}",
        vocab.num_merges(),
        specials.len(),
        model_path.display()
    );
    Ok(())
}

/// Loads a tokenizer from a `.model` file.
///
/// The vocabulary table is rebuilt from the merge rules.
///
/// # Errors
///
/// - [`ModelIoError::InvalidPath`] unless the file ends in `.model`.
/// - [`ModelIoError::VersionMismatch`] if the first line is not [`MODEL_VERSION`].
/// - [`ModelIoError::Malformed`] for truncated files, unparsable lines,
///   duplicate special tokens, or merge rules referencing undefined ids or
///   repeating an earlier pair.
/// - [`ModelIoError::Config`] if the stored pattern does not compile.
/// - [`ModelIoError::SpecialToken`] if the special tokens are invalid.
pub fn load(model_file: &Path) -> Result<Tokenizer, ModelIoError> {
    if model_file.extension().is_none_or(|ext| ext != MODEL_EXT) {
        return Err(ModelIoError::InvalidPath(model_file.to_path_buf()));
    }

    let contents = fs::read_to_string(model_file)?;
    let eof_line = contents.lines().count() + 1;
    let mut lines = contents.lines().enumerate().map(|(i, l)| (i + 1, l));

    let mut next_line = |what: &str| {
        lines.next().ok_or_else(|| ModelIoError::Malformed {
            line: eof_line,
            reason: format!("unexpected end of file, expected {what}"),
        })
    };

    let (_, version) = next_line("version tag")?;
    if version != MODEL_VERSION {
        return Err(ModelIoError::VersionMismatch {
            found: version.to_string(),
        });
    }

    let (_, pattern) = next_line("split pattern")?;
    let chunker = Chunker::from_pattern(pattern)?;

    let (line, count) = next_line("special token count")?;
    let num_special: usize = count.trim().parse().map_err(|_| ModelIoError::Malformed {
        line,
        reason: format!("invalid special token count {count:?}"),
    })?;

    let mut special_tokens: HashMap<String, Token> = HashMap::with_capacity(num_special);
    for _ in 0..num_special {
        let (line, entry) = next_line("special token")?;
        let (text, id) = parse_special(entry).ok_or_else(|| ModelIoError::Malformed {
            line,
            reason: format!("expected \"<text> <id>\", got {entry:?}"),
        })?;
        if special_tokens.insert(text.to_string(), id).is_some() {
            return Err(ModelIoError::Malformed {
                line,
                reason: format!("duplicate special token {text:?}"),
            });
        }
    }

    let mut vocab = Vocabulary::new();
    for (line, entry) in lines {
        let pair = parse_merge(entry).ok_or_else(|| ModelIoError::Malformed {
            line,
            reason: format!("expected \"<id> <id>\", got {entry:?}"),
        })?;
        vocab
            .push_merge(pair)
            .map_err(|reason| ModelIoError::Malformed { line, reason })?;
    }
    vocab.register_special_tokens(special_tokens)?;

    log::debug!(
        "loaded {} merges and {} special tokens from {}",
        vocab.num_merges(),
        vocab.special_tokens().len(),
        model_file.display()
    );

    Ok(Tokenizer::from_parts(chunker, vocab))
}

/// Writes one line per token: `[s0][s1] -> [s] id` for learned tokens,
/// `[s] id` for leaves and special tokens.
fn write_vocab(w: &mut impl Write, vocab: &Vocabulary) -> std::io::Result<()> {
    for (id, bytes) in vocab.vocab().iter().enumerate() {
        let rendered = render_token(bytes);
        match vocab.children(id) {
            Some(TokenPair(left, right)) => {
                let s0 = vocab.token_bytes(left).map(render_token).unwrap_or_default();
                let s1 = vocab.token_bytes(right).map(render_token).unwrap_or_default();
                writeln!(w, "[{s0}][{s1}] -> [{rendered}] {id}")?;
            }
            None => writeln!(w, "[{rendered}] {id}")?,
        }
    }
    for (text, id) in sorted_specials(vocab.special_tokens()) {
        writeln!(w, "[{}] {id}", render_token(text.as_bytes()))?;
    }
    Ok(())
}

fn sorted_specials(special_tokens: &HashMap<String, Token>) -> Vec<(&str, Token)> {
    let mut specials: Vec<(&str, Token)> = special_tokens
        .iter()
        .map(|(text, &id)| (text.as_str(), id))
        .collect();
    specials.sort_by_key(|&(_, id)| id);
    specials
}

/// `<prefix>.<ext>`, keeping any dots already in the prefix.
fn with_suffix(prefix: &Path, ext: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(".");
    path.push(ext);
    PathBuf::from(path)
}

/// The id follows the last space, so token text may itself contain spaces.
fn parse_special(entry: &str) -> Option<(&str, Token)> {
    let (text, id) = entry.rsplit_once(' ')?;
    if text.is_empty() {
        return None;
    }
    Some((text, id.parse().ok()?))
}

fn parse_merge(entry: &str) -> Option<TokenPair> {
    let mut parts = entry.split_whitespace();
    let left = parts.next()?.parse().ok()?;
    let right = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(TokenPair(left, right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpecialTokenError;
    use tempfile::TempDir;

    fn trained_basic() -> Tokenizer {
        let mut tok = Tokenizer::basic();
        tok.train("aaabdaaabac", 259, false)
            .expect("training should succeed");
        tok
    }

    fn write_model(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("m.model");
        fs::write(&path, contents).expect("model file should be writable");
        path
    }

    #[test]
    fn test_render_token_escapes_controls() {
        assert_eq!(render_token(b"ab"), "ab");
        assert_eq!(render_token(b"a\nb\t"), "a\\u000ab\\u0009");
        assert_eq!(render_token(&[0xE2]), "\u{FFFD}");
    }

    #[test]
    fn test_render_token_escapes_format_chars() {
        // zero-width space, BOM, soft hyphen
        assert_eq!(render_token("a\u{200B}b".as_bytes()), "a\\u200bb");
        assert_eq!(render_token("\u{FEFF}".as_bytes()), "\\ufeff");
        assert_eq!(render_token("\u{AD}".as_bytes()), "\\u00ad");
        // private use and unassigned
        assert_eq!(render_token("\u{E000}".as_bytes()), "\\ue000");
        assert_eq!(render_token("\u{378}".as_bytes()), "\\u0378");
        // printable text outside ASCII is kept
        assert_eq!(render_token("é 日 🦀".as_bytes()), "é 日 🦀");
    }

    #[test]
    fn test_vocab_dump_escapes_format_chars() {
        let dir = TempDir::new().expect("temp dir");
        let mut tok = Tokenizer::basic();
        // (0xE2, 0x80) -> 256, (256, 0x8B) -> 257 spells U+200B
        tok.train(&"x\u{200B}".repeat(4), 259, false)
            .expect("training should succeed");
        let prefix = dir.path().join("zw");
        tok.save(&prefix).expect("model should save");

        let dump = fs::read_to_string(dir.path().join("zw.vocab")).expect("vocab file");
        assert!(!dump.contains('\u{200B}'));
        assert!(dump.lines().any(|l| l == "[\u{FFFD}][\u{FFFD}] -> [\\u200b] 257"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let mut tok = Tokenizer::new().expect("gpt4 pattern compiles");
        tok.train(&"hello world, hello there world\n".repeat(3), 270, false)
            .expect("training should succeed");
        tok.register_special_tokens(
            [("<|end of text|>".to_string(), 1000), ("<pad>".to_string(), 1001)]
                .into_iter()
                .collect(),
        )
        .expect("special tokens should register");

        let prefix = dir.path().join("tok.v1");
        tok.save(&prefix).expect("model should save");
        assert!(dir.path().join("tok.v1.vocab").exists());

        let loaded = Tokenizer::load(dir.path().join("tok.v1.model")).expect("model should load");
        assert_eq!(loaded.vocabulary(), tok.vocabulary());
        assert_eq!(loaded.pattern(), tok.pattern());

        let text = "hello <pad> world";
        let allowed = "all".parse().expect("known mode");
        assert_eq!(
            loaded.encode(text, &allowed).expect("text should be encodable"),
            tok.encode(text, &allowed).expect("text should be encodable")
        );
    }

    #[test]
    fn test_model_file_layout() {
        let dir = TempDir::new().expect("temp dir");
        let mut tok = trained_basic();
        tok.register_special_tokens([("<end>".to_string(), 300)].into_iter().collect())
            .expect("special tokens should register");
        let prefix = dir.path().join("basic");
        tok.save(&prefix).expect("model should save");

        let model = fs::read_to_string(dir.path().join("basic.model")).expect("model file");
        assert_eq!(model, "bpe v1\n\n1\n<end> 300\n97 97\n256 97\n257 98\n");
    }

    #[test]
    fn test_vocab_dump() {
        let dir = TempDir::new().expect("temp dir");
        let mut tok = trained_basic();
        tok.register_special_tokens([("<end>".to_string(), 300)].into_iter().collect())
            .expect("special tokens should register");
        let prefix = dir.path().join("basic");
        tok.save(&prefix).expect("model should save");

        let dump = fs::read_to_string(dir.path().join("basic.vocab")).expect("vocab file");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 260);
        assert_eq!(lines[10], "[\\u000a] 10");
        assert_eq!(lines[97], "[a] 97");
        assert_eq!(lines[256], "[a][a] -> [aa] 256");
        assert_eq!(lines[258], "[aaa][b] -> [aaab] 258");
        assert_eq!(lines[259], "[<end>] 300");
    }

    #[test]
    fn test_load_requires_model_extension() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("m.txt");
        fs::write(&path, "bpe v1\n\n0\n").expect("file should be writable");
        assert!(matches!(load(&path), Err(ModelIoError::InvalidPath(_))));
    }

    #[test]
    fn test_load_version_mismatch() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_model(&dir, "minbpe v1\n\n0\n");
        assert!(matches!(
            load(&path),
            Err(ModelIoError::VersionMismatch { found }) if found == "minbpe v1"
        ));
    }

    #[test]
    fn test_load_malformed_lines() {
        let dir = TempDir::new().expect("temp dir");
        let cases = [
            ("bpe v1\n\nx\n", 3),
            ("bpe v1\n\n1\nnoid\n", 4),
            ("bpe v1\n\n0\n97\n", 4),
            ("bpe v1\n\n0\n97 98 99\n", 4),
            // undefined component
            ("bpe v1\n\n0\n97 97\n256 300\n", 5),
            // repeated pair
            ("bpe v1\n\n0\n97 97\n97 97\n", 5),
            ("bpe v1\n\n2\n<a> 300\n<a> 301\n", 5),
        ];
        for (contents, expected_line) in cases {
            let path = write_model(&dir, contents);
            match load(&path) {
                Err(ModelIoError::Malformed { line, .. }) => {
                    assert_eq!(line, expected_line, "{contents:?}")
                }
                other => panic!("expected malformed error for {contents:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_load_truncated() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_model(&dir, "bpe v1\n\n2\n<a> 300\n");
        assert!(matches!(load(&path), Err(ModelIoError::Malformed { .. })));
    }

    #[test]
    fn test_load_rejects_colliding_special_token() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_model(&dir, "bpe v1\n\n1\n<a> 256\n97 97\n");
        assert!(matches!(
            load(&path),
            Err(ModelIoError::SpecialToken(SpecialTokenError::IllegalToken(256)))
        ));
    }

    #[test]
    fn test_load_invalid_pattern() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_model(&dir, "bpe v1\n(\n0\n");
        assert!(matches!(load(&path), Err(ModelIoError::Config(_))));
    }

    #[test]
    fn test_save_rejects_multiline_pattern() {
        let dir = TempDir::new().expect("temp dir");
        let tok = Tokenizer::with_pattern("a\n|b").expect("pattern compiles");
        let result = tok.save(dir.path().join("bad"));
        assert!(matches!(result, Err(ModelIoError::Unrepresentable(_))));
    }

    #[test]
    fn test_special_token_with_space_round_trips() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_model(&dir, "bpe v1\n\n1\n<end of text> 300\n");
        let tok = load(&path).expect("model should load");
        assert_eq!(tok.special_tokens().get("<end of text>"), Some(&300));
    }
}
