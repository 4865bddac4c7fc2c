//! Stop-string matching over a stream of text deltas.

use crate::error::ServeError;

/// Truncates streamed text at the first occurrence of any stop string.
///
/// Text that could still turn out to be the start of a stop string is held
/// back until later deltas (or [`finish`](Self::finish)) decide it. Once a
/// stop string completes, the text before its earliest occurrence is
/// released and everything from the occurrence on is discarded for good.
#[derive(Debug, Clone)]
pub struct StopStringMatcher {
    stop_strs: Vec<String>,
    /// Seen text that is a proper prefix of some stop string.
    pending: String,
    triggered: bool,
    finished: bool,
}

impl StopStringMatcher {
    /// Empty stop strings are ignored. With no stop strings the matcher
    /// passes text straight through.
    pub fn new<I, S>(stop_strs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stop_strs: stop_strs
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
            pending: String::new(),
            triggered: false,
            finished: false,
        }
    }

    /// Append `text` and return the part that is safe to emit.
    pub fn put(&mut self, text: &str) -> String {
        if self.triggered || self.finished {
            return String::new();
        }
        if self.stop_strs.is_empty() {
            return text.to_string();
        }
        self.pending.push_str(text);

        if let Some(pos) = self.earliest_match() {
            self.triggered = true;
            self.pending.truncate(pos);
            return std::mem::take(&mut self.pending);
        }

        let partial = self.partial_match_start().unwrap_or(self.pending.len());
        let rest = self.pending.split_off(partial);
        std::mem::replace(&mut self.pending, rest)
    }

    /// Release any held-back text. Returns an empty string if a stop string
    /// was matched earlier.
    ///
    /// Fails with [`ServeError::StreamClosed`] when called a second time.
    pub fn finish(&mut self) -> Result<String, ServeError> {
        if self.finished {
            return Err(ServeError::StreamClosed("stop string matcher"));
        }
        self.finished = true;
        // Held-back text is a partial match that can no longer complete.
        Ok(std::mem::take(&mut self.pending))
    }

    /// Whether a stop string has matched. Never resets.
    pub fn triggered(&self) -> bool {
        self.triggered
    }

    pub fn stop_strs(&self) -> &[String] {
        &self.stop_strs
    }

    /// Byte offset of the earliest completed stop string in `pending`.
    fn earliest_match(&self) -> Option<usize> {
        self.stop_strs
            .iter()
            .filter_map(|s| self.pending.find(s.as_str()))
            .min()
    }

    /// Start of the longest suffix of `pending` that is a proper prefix of
    /// some stop string.
    fn partial_match_start(&self) -> Option<usize> {
        self.pending
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let suffix = &self.pending[i..];
                self.stop_strs
                    .iter()
                    .any(|s| s.len() > suffix.len() && s.starts_with(suffix))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed every piece and the final flush, returning the emitted text.
    fn run(matcher: &mut StopStringMatcher, pieces: &[&str]) -> String {
        let mut out: String = pieces.iter().map(|p| matcher.put(p)).collect();
        out.push_str(&matcher.finish().unwrap());
        out
    }

    #[test]
    fn test_pass_through_without_stop_strings() {
        let mut matcher = StopStringMatcher::new(Vec::<String>::new());
        assert_eq!(matcher.put("Hello!!!"), "Hello!!!");
        assert_eq!(matcher.put(""), "");
        assert!(!matcher.triggered());
        assert_eq!(matcher.finish().unwrap(), "");
    }

    #[test]
    fn test_empty_stop_strings_ignored() {
        let mut matcher = StopStringMatcher::new([""]);
        assert!(matcher.stop_strs().is_empty());
        assert_eq!(matcher.put("abc"), "abc");
        assert!(!matcher.triggered());
    }

    #[test]
    fn test_truncates_at_first_occurrence() {
        let mut matcher = StopStringMatcher::new(["!"]);
        assert_eq!(matcher.put("Hello!!!"), "Hello");
        assert!(matcher.triggered());
        assert_eq!(matcher.put("more"), "");
        assert_eq!(matcher.finish().unwrap(), "");
    }

    #[test]
    fn test_match_across_chunk_boundary() {
        let mut matcher = StopStringMatcher::new(["<END>"]);
        assert_eq!(matcher.put("abc<E"), "abc");
        assert_eq!(matcher.put("N"), "");
        assert_eq!(matcher.put("D>tail"), "");
        assert!(matcher.triggered());
        assert_eq!(matcher.finish().unwrap(), "");
    }

    #[test]
    fn test_partial_match_released_when_broken() {
        let mut matcher = StopStringMatcher::new(["<END>"]);
        assert_eq!(matcher.put("a<EN"), "a");
        assert_eq!(matcher.put("X"), "<ENX");
        assert!(!matcher.triggered());
    }

    #[test]
    fn test_partial_match_flushed_on_finish() {
        let mut matcher = StopStringMatcher::new(["stop"]);
        assert_eq!(matcher.put("non-st"), "non-");
        assert_eq!(matcher.finish().unwrap(), "st");
        assert!(!matcher.triggered());
    }

    #[test]
    fn test_earliest_start_wins() {
        // Both complete in one delta; "bcde" starts first.
        let mut matcher = StopStringMatcher::new(["cd", "bcde"]);
        assert_eq!(run(&mut matcher, &["abcdef"]), "a");

        let mut matcher = StopStringMatcher::new(["bcde", "x"]);
        assert_eq!(run(&mut matcher, &["ab", "cdxe"]), "abcd");
    }

    #[test]
    fn test_first_completed_match_triggers() {
        // "cd" completes while the longer "bcde" is still open.
        let mut matcher = StopStringMatcher::new(["cd", "bcde"]);
        assert_eq!(matcher.put("abc"), "a");
        assert_eq!(matcher.put("d"), "b");
        assert!(matcher.triggered());
        assert_eq!(matcher.put("ef"), "");
        assert_eq!(matcher.finish().unwrap(), "");

        let mut matcher = StopStringMatcher::new(["cd", "bcde"]);
        assert_eq!(matcher.put("abcd"), "ab");
        assert!(matcher.triggered());
    }

    #[test]
    fn test_overlapping_candidates_keep_longest_suffix() {
        let mut matcher = StopStringMatcher::new(["aab"]);
        // "aa" may still become "aab"; only the first "a" of "aaa" is safe.
        assert_eq!(matcher.put("aaa"), "a");
        assert_eq!(matcher.put("b"), "");
        assert!(matcher.triggered());
    }

    #[test]
    fn test_chunking_does_not_change_result() {
        let text = "The answer is 42.\n\nQuestion: next";
        let expected = "The answer is 42.";
        for chunk in 1..=text.len() {
            let mut matcher = StopStringMatcher::new(["\n\nQuestion:", "###"]);
            let pieces: Vec<&str> = text
                .as_bytes()
                .chunks(chunk)
                .map(|c| std::str::from_utf8(c).unwrap())
                .collect();
            assert_eq!(run(&mut matcher, &pieces), expected, "chunk size {}", chunk);
            assert!(matcher.triggered());
        }
    }

    #[test]
    fn test_multibyte_partial_match() {
        let mut matcher = StopStringMatcher::new(["\u{00E9}t\u{00E9}"]);
        assert_eq!(matcher.put("caf\u{00E9}"), "caf");
        assert_eq!(matcher.put(" "), "\u{00E9} ");
        assert_eq!(matcher.put("\u{00E9}t"), "");
        assert_eq!(matcher.put("\u{00E9}!"), "");
        assert!(matcher.triggered());
    }

    #[test]
    fn test_triggered_is_monotonic() {
        let mut matcher = StopStringMatcher::new(["x"]);
        matcher.put("axb");
        assert!(matcher.triggered());
        matcher.put("yyy");
        matcher.finish().unwrap();
        assert!(matcher.triggered());
    }

    #[test]
    fn test_double_finish_fails() {
        let mut matcher = StopStringMatcher::new(["x"]);
        matcher.finish().unwrap();
        assert!(matcher.finish().is_err());
        assert_eq!(matcher.put("abc"), "");
    }
}
