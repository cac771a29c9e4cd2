//! Programmable message sieve.
//!
//! A sieve is an ordered list of filter rules. Each rule watches a set of
//! channels for lines that begin with a prefix; matching lines are split
//! into words and the configured word positions are recorded as one result
//! tuple under the rule's name. The sieve is inert until installed on a
//! [`MessageBus`](crate::MessageBus).

use std::collections::VecDeque;

use crate::{ChannelMask, Message, push_capped};

/// One filter rule of the sieve.
#[derive(Debug, Clone)]
pub struct SieveRule {
    /// Name by which recorded results are inquired.
    pub name: String,
    pub channels: ChannelMask,
    /// Line start to watch for. Leading '?' characters match any character.
    pub prefix: String,
    /// Separator characters for word splitting.
    pub separators: String,
    /// Word positions (0-based, counted after the prefix) to record.
    pub word_idx: Vec<usize>,
    /// Maximum recorded tuples; 0 means unlimited. Older tuples are
    /// discarded when the cap is exceeded.
    pub max_results: usize,
}

impl SieveRule {
    pub fn new(
        name: &str,
        channels: ChannelMask,
        prefix: &str,
        separators: &str,
        word_idx: &[usize],
        max_results: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            channels,
            prefix: prefix.to_string(),
            separators: separators.to_string(),
            word_idx: word_idx.to_vec(),
            max_results,
        }
    }

    /// Matches `line` against the prefix, honoring leading '?' wildcards.
    /// Returns the prefix length on match.
    fn match_prefix(&self, line: &str) -> Option<usize> {
        let prefix = self.prefix.as_bytes();
        let line = line.as_bytes();
        if line.len() < prefix.len() {
            return None;
        }
        for (i, &p) in prefix.iter().enumerate() {
            if p != b'?' && line[i] != p {
                return None;
            }
        }
        Some(prefix.len())
    }
}

struct RuleState {
    rule: SieveRule,
    results: VecDeque<Vec<String>>,
}

/// Ordered collection of rules plus their recorded results.
pub struct Sieve {
    rules: Vec<RuleState>,
}

impl Default for Sieve {
    fn default() -> Self {
        Self::new()
    }
}

impl Sieve {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: SieveRule) {
        self.rules.push(RuleState {
            rule,
            results: VecDeque::new(),
        });
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.rule.name.as_str()).collect()
    }

    /// Feeds one message through every rule in order.
    pub(crate) fn inspect(&mut self, msg: &Message) {
        for state in &mut self.rules {
            if !state.rule.channels.matches(msg.channel) {
                continue;
            }
            let Some(skip) = state.rule.match_prefix(&msg.text) else {
                continue;
            };
            let words = parse_line(&msg.text[skip..], &state.rule.separators);
            let tuple: Vec<String> = state
                .rule
                .word_idx
                .iter()
                .map(|&idx| words.get(idx).cloned().unwrap_or_default())
                .collect();
            push_capped(&mut state.results, tuple, state.rule.max_results);
        }
    }

    /// Takes all recorded tuples of the named rule, oldest first.
    pub fn take_results(&mut self, name: &str) -> Option<Vec<Vec<String>>> {
        let state = self.rules.iter_mut().find(|r| r.rule.name == name)?;
        Some(state.results.drain(..).collect())
    }

    pub fn clear_results(&mut self) {
        for state in &mut self.rules {
            state.results.clear();
        }
    }
}

/// Splits a message line into words at any of the separator characters.
/// Runs of separators count as one split; empty words are not produced.
pub fn parse_line(line: &str, separators: &str) -> Vec<String> {
    let line = line.trim_end_matches('\n');
    line.split(|c: char| separators.contains(c))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, Severity};

    fn result_msg(text: &str) -> Message {
        Message::new(0, Severity::Note, Channel::Result, text)
    }

    #[test]
    fn parse_line_splits_on_separator_runs() {
        assert_eq!(
            parse_line("  1    32s   256   BACKUP", " \t"),
            vec!["1", "32s", "256", "BACKUP"]
        );
        assert_eq!(parse_line("", " "), Vec::<String>::new());
    }

    #[test]
    fn rule_records_selected_words() {
        let mut sieve = Sieve::new();
        sieve.add_rule(SieveRule::new(
            "session",
            ChannelMask::RESULT,
            "ISO session  :",
            " \t",
            &[0, 1, 2],
            0,
        ));
        sieve.inspect(&result_msg("ISO session  :   1   32s  256"));
        sieve.inspect(&result_msg("ISO session  :   2  320s  256"));
        sieve.inspect(&result_msg("Media status : appendable"));
        let results = sieve.take_results("session").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], vec!["1", "32s", "256"]);
        assert_eq!(results[1], vec!["2", "320s", "256"]);
        assert!(sieve.take_results("session").unwrap().is_empty());
    }

    #[test]
    fn question_mark_prefix_matches_any_character() {
        let mut sieve = Sieve::new();
        sieve.add_rule(SieveRule::new(
            "dev",
            ChannelMask::RESULT,
            "??  -dev",
            " \t",
            &[0],
            0,
        ));
        sieve.inspect(&result_msg("12  -dev /dev/sr0"));
        sieve.inspect(&result_msg("1   -dev /dev/sr1"));
        let results = sieve.take_results("dev").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], vec!["/dev/sr0"]);
    }

    #[test]
    fn result_cap_discards_oldest() {
        let mut sieve = Sieve::new();
        sieve.add_rule(SieveRule::new(
            "cap",
            ChannelMask::RESULT,
            "",
            " ",
            &[0],
            2,
        ));
        sieve.inspect(&result_msg("one"));
        sieve.inspect(&result_msg("two"));
        sieve.inspect(&result_msg("three"));
        let results = sieve.take_results("cap").unwrap();
        assert_eq!(results, vec![vec!["two"], vec!["three"]]);
    }
}
