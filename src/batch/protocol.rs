// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The batch runner's line-framed wire protocol: request framing and
//! status-line parsing.

use crate::errors::BatchProtocolError;

/// The outcome a batch worker reports for a single job, per spec.md §4.7.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchOutcome {
    Pass,
    Ok,
    Fail,
    Crash,
    Timeout,
    ParseFail,
}

impl BatchOutcome {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "PASS" => Some(Self::Pass),
            "OK" => Some(Self::Ok),
            "FAIL" => Some(Self::Fail),
            "CRASH" => Some(Self::Crash),
            "TIMEOUT" => Some(Self::Timeout),
            "PARSE_FAIL" => Some(Self::ParseFail),
            _ => None,
        }
    }

    /// The exit code a one-shot run of the same command would have
    /// produced, per spec.md §4.7/§6.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Pass | Self::Ok => 0,
            Self::Fail | Self::Timeout => 1,
            Self::ParseFail => 245,
            Self::Crash => 253,
        }
    }
}

/// One line of the worker's status channel, as parsed from a `>>> `
/// prefixed line.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum StatusLine {
    /// `>>> TEST <OUTCOME> ...` — ends the current job.
    Test(BatchOutcome),
    /// `>>> BATCH ...` — informational, ignored.
    Batch,
    /// `>>> EOF STDERR` — end of this job's stderr stream.
    EofStderr,
}

/// Parses one `>>> `-prefixed line. Any prefix outside the known
/// vocabulary is a protocol violation (spec.md §4.7).
pub(super) fn parse_status_line(line: &str) -> Result<StatusLine, BatchProtocolError> {
    let rest = line
        .strip_prefix(">>> ")
        .expect("parse_status_line called on a non->>>-prefixed line");

    if rest == "EOF STDERR" {
        return Ok(StatusLine::EofStderr);
    }
    if let Some(rest) = rest.strip_prefix("BATCH") {
        let _ = rest;
        return Ok(StatusLine::Batch);
    }
    if let Some(rest) = rest.strip_prefix("TEST ") {
        let outcome_word = rest.split_whitespace().next().unwrap_or("");
        return match BatchOutcome::parse(outcome_word) {
            Some(outcome) => Ok(StatusLine::Test(outcome)),
            None => Err(BatchProtocolError::UnrecognizedStatusLine(line.to_string())),
        };
    }
    Err(BatchProtocolError::UnrecognizedStatusLine(line.to_string()))
}

/// Builds the request line written to a batch worker's stdin to start a
/// job: a JSON-encoded argument array for JSON-mode runners (e.g.
/// `fasta`), or the arguments space-joined otherwise, terminated by a
/// newline.
pub(super) fn encode_request(args: &[String], json_protocol: bool) -> String {
    let mut line = if json_protocol {
        serde_json::to_string(args).expect("argument strings are always valid JSON")
    } else {
        args.join(" ")
    };
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line_parses_outcome() {
        assert_eq!(
            parse_status_line(">>> TEST PASS extra ignored").unwrap(),
            StatusLine::Test(BatchOutcome::Pass)
        );
    }

    #[test]
    fn unrecognized_outcome_word_is_an_error() {
        assert!(parse_status_line(">>> TEST BOGUS").is_err());
    }

    #[test]
    fn batch_line_is_ignored() {
        assert_eq!(
            parse_status_line(">>> BATCH START").unwrap(),
            StatusLine::Batch
        );
    }

    #[test]
    fn eof_stderr_is_recognized() {
        assert_eq!(
            parse_status_line(">>> EOF STDERR").unwrap(),
            StatusLine::EofStderr
        );
    }

    #[test]
    fn unknown_prefix_is_an_error() {
        assert!(parse_status_line(">>> WAT").is_err());
    }

    #[test]
    fn exit_codes_match_the_spec_table() {
        assert_eq!(BatchOutcome::Ok.exit_code(), 0);
        assert_eq!(BatchOutcome::Pass.exit_code(), 0);
        assert_eq!(BatchOutcome::Fail.exit_code(), 1);
        assert_eq!(BatchOutcome::Timeout.exit_code(), 1);
        assert_eq!(BatchOutcome::ParseFail.exit_code(), 245);
        assert_eq!(BatchOutcome::Crash.exit_code(), 253);
    }

    #[test]
    fn json_mode_encodes_an_array() {
        let line = encode_request(&["a".to_string(), "b c".to_string()], true);
        assert_eq!(line, "[\"a\",\"b c\"]\n");
    }

    #[test]
    fn space_joined_mode_joins_with_spaces() {
        let line = encode_request(&["a".to_string(), "b".to_string()], false);
        assert_eq!(line, "a b\n");
    }
}
