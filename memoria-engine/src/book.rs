// Copyright 2025 Memoria Contributors (https://github.com/memoria-db/memoria)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Book parsing: split long text into chapters for ingestion.

/// One parsed chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    pub title: String,
    pub body: String,
}

/// Fallback slice size when a text has no recognizable chapter headings.
const FALLBACK_CHAPTER_BYTES: usize = 50_000;

/// Split text into chapters on heading lines ("Chapter N", "CHAPTER N",
/// markdown "#" headings). Text without headings is sliced into
/// fixed-size chapters at line boundaries.
pub fn split_chapters(book_title: &str, text: &str) -> Vec<Chapter> {
    let mut chapters: Vec<Chapter> = Vec::new();
    let mut current_title: Option<String> = None;
    let mut current_body = String::new();

    for line in text.lines() {
        if let Some(title) = heading_of(line) {
            if current_title.is_some() || !current_body.trim().is_empty() {
                chapters.push(Chapter {
                    title: current_title
                        .take()
                        .unwrap_or_else(|| format!("{book_title} — front matter")),
                    body: std::mem::take(&mut current_body),
                });
            }
            current_title = Some(title);
        } else {
            current_body.push_str(line);
            current_body.push('\n');
        }
    }
    if current_title.is_some() || !current_body.trim().is_empty() {
        chapters.push(Chapter {
            title: current_title.unwrap_or_else(|| book_title.to_string()),
            body: current_body,
        });
    }

    if chapters.len() > 1 {
        return chapters;
    }

    // No headings found: slice by size so very large texts still ingest as
    // bounded memories.
    let body = chapters.pop().map(|c| c.body).unwrap_or_default();
    if body.len() <= FALLBACK_CHAPTER_BYTES {
        return vec![Chapter {
            title: book_title.to_string(),
            body,
        }];
    }
    let mut slices = Vec::new();
    let mut current = String::new();
    for line in body.lines() {
        if current.len() + line.len() + 1 > FALLBACK_CHAPTER_BYTES && !current.is_empty() {
            slices.push(current);
            current = String::new();
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.is_empty() {
        slices.push(current);
    }
    slices
        .into_iter()
        .enumerate()
        .map(|(index, body)| Chapter {
            title: format!("{book_title} — part {}", index + 1),
            body,
        })
        .collect()
}

fn heading_of(line: &str) -> Option<String> {
    let trimmed = line.trim();
    let lower = trimmed.to_lowercase();
    if lower.starts_with("chapter ") && trimmed.len() < 80 {
        return Some(trimmed.to_string());
    }
    if let Some(rest) = trimmed.strip_prefix('#') {
        let rest = rest.trim_start_matches('#').trim();
        if !rest.is_empty() {
            return Some(rest.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_chapter_headings() {
        let text = "Chapter 1: The Start\nfirst body\n\nChapter 2: The End\nsecond body\n";
        let chapters = split_chapters("Novel", text);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "Chapter 1: The Start");
        assert!(chapters[0].body.contains("first body"));
        assert_eq!(chapters[1].title, "Chapter 2: The End");
    }

    #[test]
    fn splits_on_markdown_headings() {
        let text = "# Intro\nhello\n## Deep dive\nmore\n";
        let chapters = split_chapters("Guide", text);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "Intro");
        assert_eq!(chapters[1].title, "Deep dive");
    }

    #[test]
    fn keeps_front_matter_before_the_first_heading() {
        let text = "preface text\nChapter 1\nbody\n";
        let chapters = split_chapters("Novel", text);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "Novel — front matter");
        assert_eq!(chapters[1].title, "Chapter 1");
    }

    #[test]
    fn headingless_text_is_one_chapter_when_small() {
        let chapters = split_chapters("Note", "just a short note\n");
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "Note");
    }

    #[test]
    fn headingless_text_is_sliced_when_large() {
        let line = "words words words words words\n";
        let text = line.repeat(4_000); // ~120 KB
        let chapters = split_chapters("Dump", &text);
        assert!(chapters.len() >= 2);
        let total: usize = chapters.iter().map(|c| c.body.len()).sum();
        assert_eq!(total, text.len());
        assert!(chapters.iter().all(|c| c.body.len() <= FALLBACK_CHAPTER_BYTES));
    }
}
