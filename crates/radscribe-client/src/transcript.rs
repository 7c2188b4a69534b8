/// Reconciles interim and final transcript events into the two texts a
/// caller reads: the committed transcript and the current provisional guess.
///
/// Final segments are append-only and joined with single spaces. The interim
/// text is fully replaced on every non-final event and cleared as soon as a
/// final segment for the utterance arrives.
#[derive(Clone, Debug, Default)]
pub struct TranscriptBuffer {
    committed: String,
    interim: String,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, text: &str, is_final: bool) {
        if is_final {
            if !self.committed.is_empty() {
                self.committed.push(' ');
            }
            self.committed.push_str(text);
            self.interim.clear();
        } else {
            self.interim.clear();
            self.interim.push_str(text);
        }
    }

    pub fn final_text(&self) -> &str {
        &self.committed
    }

    pub fn interim_text(&self) -> &str {
        &self.interim
    }

    pub fn clear(&mut self) {
        self.committed.clear();
        self.interim.clear();
    }

    pub fn clear_interim(&mut self) {
        self.interim.clear();
    }
}
