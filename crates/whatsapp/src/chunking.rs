//! Reply splitting for channels with a per-message length cap.
//!
//! Lengths are counted in characters. Paragraphs (blank-line separated) are packed
//! greedily; an oversized paragraph is packed word by word, and a single word longer
//! than the cap is cut at character boundaries. No chunk ever exceeds `max_length`.

const PARAGRAPH_BREAK: &str = "\n\n";

pub fn split_message_chunks(text: &str, max_length: usize) -> Vec<String> {
    let max_length = max_length.max(1);
    let cleaned = text.trim();
    if cleaned.is_empty() {
        return Vec::new();
    }
    if char_len(cleaned) <= max_length {
        return vec![cleaned.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in cleaned.split(PARAGRAPH_BREAK).map(str::trim).filter(|p| !p.is_empty()) {
        if fits_joined(&current, PARAGRAPH_BREAK, paragraph, max_length) {
            join(&mut current, PARAGRAPH_BREAK, paragraph);
            continue;
        }
        flush(&mut chunks, &mut current);

        if char_len(paragraph) <= max_length {
            current.push_str(paragraph);
            continue;
        }

        for word in paragraph.split_whitespace() {
            if fits_joined(&current, " ", word, max_length) {
                join(&mut current, " ", word);
                continue;
            }
            flush(&mut chunks, &mut current);

            let mut pieces = hard_split(word, max_length);
            // The tail stays open so following words can join it.
            if let Some(tail) = pieces.pop() {
                chunks.extend(pieces);
                current = tail;
            }
        }
    }

    flush(&mut chunks, &mut current);
    chunks
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn fits_joined(current: &str, separator: &str, next: &str, max_length: usize) -> bool {
    let separator_len = if current.is_empty() { 0 } else { char_len(separator) };
    char_len(current) + separator_len + char_len(next) <= max_length
}

fn join(current: &mut String, separator: &str, next: &str) {
    if !current.is_empty() {
        current.push_str(separator);
    }
    current.push_str(next);
}

fn flush(chunks: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
}

fn hard_split(word: &str, max_length: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars.chunks(max_length).map(|piece| piece.iter().collect()).collect()
}
