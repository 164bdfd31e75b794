//! Newline-delimited JSON over stdin/stdout, one request per line.
//!
//! Used by desktop shells and by the integration tests. Logging goes to
//! stderr so stdout carries only responses.

use std::io::{BufRead, Write};

use crate::api::{err, handle_request, AppState, Request};

/// Serves requests until the input closes. A line that is not a request is
/// answered with `bad_json` and an empty id.
pub fn serve<R: BufRead, W: Write>(state: &mut AppState, input: R, mut output: W) -> anyhow::Result<()> {
    for line in input.lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed; stopping");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<Request>(&line) {
            Ok(req) => handle_request(state, req),
            Err(e) => err("", "bad_json", e.to_string(), None),
        };
        writeln!(output, "{resp}")?;
        output.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::Value;

    fn run(lines: &str) -> Vec<Value> {
        let cfg = Config::default();
        let mut state = AppState::in_memory(&cfg).expect("state");
        let mut out = Vec::new();
        serve(&mut state, lines.as_bytes(), &mut out).expect("serve");
        String::from_utf8(out)
            .expect("utf8")
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect()
    }

    #[test]
    fn answers_each_line_in_order() {
        let out = run("{\"id\":\"1\",\"method\":\"health\"}\n\n{\"id\":\"2\",\"method\":\"nope\"}\n");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["id"], "1");
        assert_eq!(out[0]["ok"], true);
        assert_eq!(out[1]["error"]["code"], "not_implemented");
    }

    #[test]
    fn malformed_lines_get_bad_json() {
        let out = run("not json\n");
        assert_eq!(out[0]["ok"], false);
        assert_eq!(out[0]["error"]["code"], "bad_json");
    }
}
