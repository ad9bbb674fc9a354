//! Streaming sentence pipeliner
//!
//! Accumulates LLM response fragments and emits whole sentences as early as
//! possible so synthesis of sentence N+1 overlaps playback of sentence N.
//! Boundaries: terminal punctuation followed by whitespace, bullet and
//! numbered-list line starts, paragraph breaks, and a colon at end of line.
//! Emoji are stripped before emission since downstream voices mispronounce
//! them. `flush()` emits whatever trailing partial text remains.

/// Where a boundary was found: sentence ends (exclusive) at `end`,
/// the next sentence resumes at `rest`
struct Boundary {
    end: usize,
    rest: usize,
}

pub struct SentencePipeliner<F: FnMut(String)> {
    buf: String,
    on_sentence: F,
}

impl<F: FnMut(String)> SentencePipeliner<F> {
    pub fn new(on_sentence: F) -> Self {
        Self {
            buf: String::new(),
            on_sentence,
        }
    }

    /// Append a response fragment, emitting any sentences it completes
    pub fn push(&mut self, fragment: &str) {
        self.buf.push_str(fragment);
        while let Some(boundary) = find_boundary(&self.buf) {
            let sentence = clean_sentence(&self.buf[..boundary.end]);
            self.buf = self.buf[boundary.rest..].trim_start().to_string();
            if !sentence.is_empty() {
                (self.on_sentence)(sentence);
            }
        }
    }

    /// Emit any trailing partial text as one last sentence
    pub fn flush(&mut self) {
        let sentence = clean_sentence(&self.buf);
        self.buf.clear();
        if !sentence.is_empty() {
            (self.on_sentence)(sentence);
        }
    }

    /// Text currently buffered and not yet emitted
    pub fn pending(&self) -> &str {
        &self.buf
    }
}

/// Strip emoji (supplementary multilingual plane) and surrounding whitespace
fn clean_sentence(text: &str) -> String {
    text.chars()
        .filter(|&c| !(0x10000..=0x1FFFF).contains(&(c as u32)))
        .collect::<String>()
        .trim()
        .to_string()
}

/// True when every character before `end` in the current buffer is a digit,
/// which marks `1.`-style list markers rather than sentence ends
fn is_list_marker(buf: &str, end: usize) -> bool {
    let head = &buf[..end];
    !head.is_empty() && head.chars().all(|c| c.is_ascii_digit())
}

/// Find the earliest fully-determined sentence boundary. Returns `None`
/// when the buffer ends mid-decision (e.g. a trailing `.` that may yet be
/// followed by a digit, or a `\n` whose line kind is unknown).
fn find_boundary(buf: &str) -> Option<Boundary> {
    let mut chars = buf.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        match ch {
            '.' | '!' | '?' => {
                let Some(&(next_idx, next)) = chars.peek() else {
                    // End of buffer: emitted on flush or once more text arrives
                    return None;
                };
                if next.is_whitespace() && !is_list_marker(buf, idx) {
                    return Some(Boundary {
                        end: next_idx,
                        rest: next_idx,
                    });
                }
            }
            ':' => {
                let Some(&(next_idx, next)) = chars.peek() else {
                    return None;
                };
                if next == '\n' {
                    return Some(Boundary {
                        end: next_idx,
                        rest: next_idx + 1,
                    });
                }
            }
            '\n' => {
                let Some(&(next_idx, next)) = chars.peek() else {
                    return None;
                };
                match next {
                    // Paragraph break
                    '\n' => {
                        return Some(Boundary {
                            end: idx,
                            rest: next_idx + 1,
                        })
                    }
                    // Bullet line
                    '-' | '*' => {
                        return Some(Boundary {
                            end: idx,
                            rest: next_idx,
                        })
                    }
                    // Possible numbered list: \n123.
                    d if d.is_ascii_digit() => {
                        let mut lookahead = chars.clone();
                        lookahead.next();
                        loop {
                            match lookahead.next() {
                                Some((_, c)) if c.is_ascii_digit() => continue,
                                Some((_, '.')) => {
                                    return Some(Boundary {
                                        end: idx,
                                        rest: next_idx,
                                    })
                                }
                                Some(_) => break,
                                // Digits run to end of buffer: undecided
                                None => return None,
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
    None
}
