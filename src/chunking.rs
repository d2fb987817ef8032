//! Word-count chunking.
//!
//! Text is consumed one whitespace-delimited word at a time. A chunk is
//! closed as soon as its running length, counted as characters plus one
//! separator between each pair of words, reaches the size limit. Chunk
//! text is the words joined by single spaces, so original spacing and line
//! breaks are not preserved.

/// A closed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkText {
    pub text: String,
    pub words: u32,
}

/// Incremental chunk accumulator.
///
/// # Examples
///
/// ```
/// use localdocs::chunking::ChunkBuilder;
///
/// let mut builder = ChunkBuilder::new(10);
/// assert!(builder.push("aaaa").is_none());
/// assert!(builder.push("bb").is_none());
///
/// // 4 + 2 + 3 characters plus 2 separators reaches the limit.
/// let chunk = builder.push("ccc").unwrap();
/// assert_eq!(chunk.text, "aaaa bb ccc");
/// assert_eq!(chunk.words, 3);
///
/// assert!(builder.push("dddd").is_none());
/// assert_eq!(builder.finish().unwrap().text, "dddd");
/// assert!(builder.finish().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    limit: usize,
    words: Vec<String>,
    char_count: usize,
}

impl ChunkBuilder {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            words: Vec::new(),
            char_count: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Length of the buffered text if it were closed now.
    pub fn pending_len(&self) -> usize {
        if self.words.is_empty() {
            0
        } else {
            self.char_count + self.words.len() - 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Add a word, returning the closed chunk if this word reached the
    /// limit.
    pub fn push(&mut self, word: &str) -> Option<ChunkText> {
        self.char_count += word.chars().count();
        self.words.push(word.to_string());
        if self.pending_len() >= self.limit {
            return self.finish();
        }
        None
    }

    /// Close whatever is buffered.
    pub fn finish(&mut self) -> Option<ChunkText> {
        if self.words.is_empty() {
            return None;
        }
        let words = self.words.len() as u32;
        let text = self.words.join(" ");
        self.words.clear();
        self.char_count = 0;
        Some(ChunkText { text, words })
    }
}

/// Chunk a whole block of text at once.
///
/// # Examples
///
/// ```
/// use localdocs::chunking::chunk_text;
///
/// let chunks = chunk_text("one two three four", 5);
/// let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
/// assert_eq!(texts, ["one two", "three", "four"]);
/// ```
pub fn chunk_text(text: &str, limit: usize) -> Vec<ChunkText> {
    let mut builder = ChunkBuilder::new(limit);
    let mut chunks: Vec<ChunkText> = text
        .split_whitespace()
        .filter_map(|word| builder.push(word))
        .collect();
    chunks.extend(builder.finish());
    chunks
}
