//! Local synthesis bookkeeping for text-only responses.
//!
//! Streamed text is cut into sentences, synthesized one at a time in order,
//! and fed to the arbiter with locally assigned sequence numbers. Running
//! one request at a time keeps playback order without gaps when a sentence
//! fails to synthesize.

use std::collections::VecDeque;

/// Split complete sentences off the front of `buf`. A sentence ends at
/// `.`, `!`, `?` or a newline followed by whitespace; the unfinished tail
/// stays in `buf`.
pub fn take_sentences(buf: &mut String) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = buf.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => matches!(chars.peek(), Some((_, next)) if next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            let sentence = buf[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            start = end;
        }
    }

    buf.drain(..start);
    sentences
}

/// Synthesis state for the active response.
#[derive(Debug)]
pub struct ResponseSpeech {
    pub response_id: String,
    pub generation: u64,
    text: String,
    queue: VecDeque<String>,
    in_flight: bool,
    next_sequence: u64,
    /// `message.done` has arrived.
    done: bool,
    /// Audio is coming from the server; local synthesis is off.
    server_audio: bool,
}

impl ResponseSpeech {
    pub fn new(response_id: impl Into<String>, generation: u64) -> Self {
        Self {
            response_id: response_id.into(),
            generation,
            text: String::new(),
            queue: VecDeque::new(),
            in_flight: false,
            next_sequence: 0,
            done: false,
            server_audio: false,
        }
    }

    pub fn mark_server_audio(&mut self) {
        self.server_audio = true;
        self.queue.clear();
        self.text.clear();
    }

    pub fn has_server_audio(&self) -> bool {
        self.server_audio
    }

    /// Append streamed text; complete sentences join the queue.
    pub fn push_text(&mut self, text: &str) {
        if self.server_audio {
            return;
        }
        self.text.push_str(text);
        let sentences = take_sentences(&mut self.text);
        self.queue.extend(sentences);
    }

    /// Queue whatever text is left as a final sentence.
    pub fn flush_text(&mut self) {
        let rest = std::mem::take(&mut self.text);
        let rest = rest.trim();
        if !rest.is_empty() && !self.server_audio {
            self.queue.push_back(rest.to_string());
        }
    }

    pub fn mark_done(&mut self) {
        self.done = true;
        self.flush_text();
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next sentence to synthesize, if nothing is in flight.
    pub fn next_request(&mut self) -> Option<String> {
        if self.in_flight {
            return None;
        }
        let sentence = self.queue.pop_front()?;
        self.in_flight = true;
        Some(sentence)
    }

    /// A synthesis result came back. Returns the sequence to use for its audio.
    pub fn finish_request(&mut self, produced_audio: bool) -> Option<u64> {
        self.in_flight = false;
        if !produced_audio {
            return None;
        }
        let seq = self.next_sequence;
        self.next_sequence += 1;
        Some(seq)
    }

    /// Nothing queued or running.
    pub fn is_idle(&self) -> bool {
        !self.in_flight && self.queue.is_empty()
    }

    /// `message.done` seen and every sentence delivered.
    pub fn is_complete(&self) -> bool {
        self.done && self.is_idle()
    }
}
