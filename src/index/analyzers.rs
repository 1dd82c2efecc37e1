use tantivy::tokenizer::{LowerCaser, RawTokenizer, SimpleTokenizer, TextAnalyzer, TokenizerManager};

/// Analyzer used when a field does not name one.
pub const DEFAULT_ANALYZER: &str = "default";

/// Tokenizers available to index definitions.
///
/// tantivy's built-ins (`default`, `raw`, `whitespace`, `en_stem`) plus
/// `simple` (word split, lower-cased) and `keyword_lower` (whole value,
/// lower-cased). Every repository and query parser shares one instance so
/// that the same analyzer id means the same thing at index and query time.
pub fn tokenizer_manager() -> TokenizerManager {
    let manager = TokenizerManager::default();

    let simple = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .build();
    manager.register("simple", simple);

    let keyword_lower = TextAnalyzer::builder(RawTokenizer::default())
        .filter(LowerCaser)
        .build();
    manager.register("keyword_lower", keyword_lower);

    manager
}

pub fn is_known(manager: &TokenizerManager, analyzer: &str) -> bool {
    manager.get(analyzer).is_some()
}
