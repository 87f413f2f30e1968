use std::collections::HashSet;

/// N-gram key generator.
///
/// Text is segmented into runs of ASCII and runs of CJK code points. ASCII
/// runs produce sliding windows of `ngram_size` characters, CJK runs produce
/// windows of `kanji_ngram_size` code points. A run shorter than its window
/// emits the whole run as a degenerate term, so short tokens at segment
/// boundaries stay searchable.
#[derive(Debug, Clone)]
pub struct NgramGenerator {
    pub ngram_size: usize,
    pub kanji_ngram_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Ascii,
    Cjk,
    Other,
}

/// CJK detection covering the blocks that matter for search keys:
/// Unified Ideographs (+ Ext A), Hiragana, Katakana, CJK symbols,
/// Hangul syllables, and full-width forms.
fn char_class(c: char) -> CharClass {
    let cp = c as u32;
    if c.is_ascii() {
        if c.is_ascii_alphanumeric() {
            CharClass::Ascii
        } else {
            CharClass::Other
        }
    } else if (0x3040..=0x30FF).contains(&cp)     // Hiragana + Katakana
        || (0x3400..=0x4DBF).contains(&cp)        // CJK Ext A
        || (0x4E00..=0x9FFF).contains(&cp)        // CJK Unified
        || (0xAC00..=0xD7AF).contains(&cp)        // Hangul
        || (0xF900..=0xFAFF).contains(&cp)        // CJK Compatibility
        || (0xFF66..=0xFF9D).contains(&cp)        // Half-width Katakana
    {
        CharClass::Cjk
    } else {
        CharClass::Other
    }
}

impl NgramGenerator {
    pub fn new(ngram_size: usize, kanji_ngram_size: usize) -> Self {
        NgramGenerator {
            ngram_size: ngram_size.max(1),
            kanji_ngram_size: kanji_ngram_size.max(1),
        }
    }

    /// Generate the term set for already-normalized text.
    pub fn generate(&self, text: &str) -> HashSet<String> {
        let mut terms = HashSet::new();
        let mut run: Vec<char> = Vec::new();
        let mut run_class = CharClass::Other;

        for c in text.chars() {
            let class = char_class(c);
            if class != run_class {
                self.emit_run(&run, run_class, &mut terms);
                run.clear();
                run_class = class;
            }
            if class != CharClass::Other {
                run.push(c);
            }
        }
        self.emit_run(&run, run_class, &mut terms);

        terms
    }

    fn emit_run(&self, run: &[char], class: CharClass, terms: &mut HashSet<String>) {
        if run.is_empty() {
            return;
        }
        let n = match class {
            CharClass::Ascii => self.ngram_size,
            CharClass::Cjk => self.kanji_ngram_size,
            CharClass::Other => return,
        };
        if run.len() < n {
            terms.insert(run.iter().collect());
            return;
        }
        for window in run.windows(n) {
            terms.insert(window.iter().collect());
        }
    }
}
