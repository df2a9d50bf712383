// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-result digesting: category-aware truncation applied before a
//! result enters the conversation.  Oversized originals are archived to
//! the vault so nothing is lost, only moved out of the context window.

use idlehands_tools::OutputCategory;

/// Default per-result token cap applied when digesting.
pub(crate) const RESULT_TOKEN_CAP: usize = 2000;

/// Reduce `content` to fit `cap_tokens`.  Returns the digest and whether
/// truncation happened (truncated results get archived in full).
pub(crate) fn digest(content: &str, category: OutputCategory, cap_tokens: usize) -> (String, bool) {
    if cap_tokens == 0 {
        return (content.to_string(), false);
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return (content.to_string(), false);
    }
    let omitted = content.len() - cap_chars;
    let digest = match category {
        // Process output: the preamble and the trailing errors both matter.
        OutputCategory::HeadTail => split_head_tail(
            content,
            cap_chars,
            &format!("[... ~{omitted} bytes omitted; full output archived — vault_search to recover ...]"),
        ),
        // Match lists are relevance-ordered: keep the front.
        OutputCategory::MatchList => {
            let mut kept = String::with_capacity(cap_chars);
            let mut count = 0usize;
            for line in content.lines() {
                if kept.len() + line.len() + 1 > cap_chars {
                    break;
                }
                if !kept.is_empty() {
                    kept.push('\n');
                }
                kept.push_str(line);
                count += 1;
            }
            let total = content.lines().count();
            format!(
                "{kept}\n[... {} more matches omitted; narrow the pattern to see them ...]",
                total.saturating_sub(count)
            )
        }
        // File content: head (imports, declarations) and tail.
        OutputCategory::FileContent => split_head_tail(
            content,
            cap_chars,
            "[... middle omitted; use read_file with offset/limit for the rest ...]",
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars]
                .rfind('\n')
                .map(|p| p + 1)
                .unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted} bytes omitted ...]",
                &content[..cut]
            )
        }
    };
    (digest, true)
}

fn split_head_tail(content: &str, cap_chars: usize, notice: &str) -> String {
    let half = cap_chars / 2;
    let lines: Vec<&str> = content.lines().collect();

    let mut head = String::with_capacity(half);
    for line in &lines {
        if head.len() + line.len() + 1 > half {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_len = 0usize;
    for line in lines.iter().rev() {
        if tail_len + line.len() + 1 > half {
            break;
        }
        tail_len += line.len() + 1;
        tail_lines.push(line);
    }
    tail_lines.reverse();

    format!("{head}\n{notice}\n{}", tail_lines.join("\n"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(n: usize) -> String {
        (0..n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn small_content_passes_through() {
        let (d, truncated) = digest("short", OutputCategory::Generic, 100);
        assert_eq!(d, "short");
        assert!(!truncated);
    }

    #[test]
    fn zero_cap_disables_digesting() {
        let big = "x".repeat(100_000);
        let (d, truncated) = digest(&big, OutputCategory::Generic, 0);
        assert_eq!(d.len(), big.len());
        assert!(!truncated);
    }

    #[test]
    fn head_tail_keeps_both_ends() {
        let content = lines(2000);
        let (d, truncated) = digest(&content, OutputCategory::HeadTail, 50);
        assert!(truncated);
        assert!(d.contains("line 0"));
        assert!(d.contains("line 1999"));
        assert!(d.contains("omitted"));
    }

    #[test]
    fn match_list_keeps_leading_only() {
        let content = (0..500)
            .map(|i| format!("match {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let (d, _) = digest(&content, OutputCategory::MatchList, 50);
        assert!(d.contains("match 0"));
        assert!(!d.contains("match 499"), "tail matches are less relevant");
        assert!(d.contains("more matches omitted"));
    }

    #[test]
    fn file_content_notice_suggests_offset() {
        let content = lines(3000);
        let (d, _) = digest(&content, OutputCategory::FileContent, 50);
        assert!(d.contains("offset/limit"));
        assert!(d.contains("line 0"));
        assert!(d.contains("line 2999"));
    }

    #[test]
    fn generic_cuts_at_line_boundary() {
        let content = format!("{}\n{}", "a".repeat(30), "b".repeat(500));
        let (d, _) = digest(&content, OutputCategory::Generic, 10);
        assert!(!d.contains("bbb"), "cut must land on the newline");
        assert!(d.contains("omitted"));
    }

    #[test]
    fn digest_result_is_much_smaller_than_input() {
        let content = lines(5000);
        let (d, _) = digest(&content, OutputCategory::HeadTail, 100);
        assert!(d.len() < content.len() / 4);
    }
}
