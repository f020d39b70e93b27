//! Guest-side sandbox runner.
//!
//! Owns the persistent namespace and answers framed commands on stdio:
//! `setup` binds the document sequence, `execute` runs a program, `reset`
//! restores the pristine builtin set, `ping` answers pong. An undecodable
//! frame ends the loop (fail-closed); an evaluation error is captured into
//! an error reply and the loop continues.

pub mod lang;
pub mod value;

use std::io::{Read, Write};

use serde_json::{Value as Json, json};

pub use lang::{FinalMarker, GuestError, HostBridge, ProgramResult, run_program};
pub use value::{Builtin, Namespace, Value, list_user_vars, register_builtins, show_vars};

use crate::protocol::MAX_PAYLOAD_SIZE;

/// Length-prefixed JSON framing over blocking streams.
pub struct FramedIo<R: Read, W: Write> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> FramedIo<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Read one frame. `Ok(None)` means the peer closed cleanly at a frame
    /// boundary; any decode failure is an error the caller treats as
    /// fail-closed.
    pub fn read_message(&mut self) -> std::io::Result<Option<Json>> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            let n = self.reader.read(&mut prefix[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed mid-prefix",
                ));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds maximum {MAX_PAYLOAD_SIZE}"),
            ));
        }
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        let value = serde_json::from_slice(&payload)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(value))
    }

    pub fn write_message(&mut self, value: &Json) -> std::io::Result<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()
    }
}

/// Bridge that forwards sub-LLM calls over the runner's own framed stream.
struct IoBridge<'a, R: Read, W: Write> {
    io: &'a mut FramedIo<R, W>,
}

impl<R: Read, W: Write> IoBridge<'_, R, W> {
    fn round_trip(&mut self, request: Json, expect_action: &str) -> Result<Json, GuestError> {
        self.io
            .write_message(&request)
            .map_err(|e| GuestError::new(format!("failed to reach host: {e}")))?;
        let response = self
            .io
            .read_message()
            .map_err(|e| GuestError::new(format!("failed to read host reply: {e}")))?
            .ok_or_else(|| GuestError::new("host closed the stream"))?;

        if response.get("action").and_then(|a| a.as_str()) != Some(expect_action) {
            return Err(GuestError::new(format!("unexpected response: {response}")));
        }
        if let Some(error) = response.get("error").and_then(|e| e.as_str()) {
            return Err(GuestError::new(error.to_string()));
        }
        Ok(response)
    }
}

impl<R: Read, W: Write> HostBridge for IoBridge<'_, R, W> {
    fn llm_query(&mut self, instruction: &str, content: &str) -> Result<String, GuestError> {
        let response = self.round_trip(
            json!({
                "action": "llm_query",
                "instruction": instruction,
                "content": content,
            }),
            "llm_response",
        )?;
        Ok(response
            .get("result")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string())
    }

    fn llm_query_batched(&mut self, prompts: &[String]) -> Result<Vec<String>, GuestError> {
        let response = self.round_trip(
            json!({
                "action": "llm_query_batch",
                "prompts": prompts,
            }),
            "llm_batch_response",
        )?;
        Ok(response
            .get("results")
            .and_then(|r| r.as_array())
            .map(|items| {
                items
                    .iter()
                    .map(|r| r.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Serialize a final value for the wire. Scalars travel natively; composite
/// values travel as their printed form.
fn final_to_json(value: &Value) -> Json {
    match value {
        Value::Str(s) => json!(s),
        Value::Int(n) => json!(n),
        Value::Bool(b) => json!(b),
        other => json!(other.str_form()),
    }
}

/// The guest command loop.
pub struct Runner<R: Read, W: Write> {
    io: FramedIo<R, W>,
    ns: Namespace,
}

impl<R: Read, W: Write> Runner<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        let mut ns = Namespace::new();
        register_builtins(&mut ns);
        Self {
            io: FramedIo::new(reader, writer),
            ns,
        }
    }

    /// Read and answer commands until EOF or an undecodable frame.
    pub fn run(&mut self) -> std::io::Result<()> {
        loop {
            let command = match self.io.read_message() {
                Ok(Some(command)) => command,
                // Clean EOF, or fail-closed on a corrupt stream.
                Ok(None) | Err(_) => break,
            };

            let action = command.get("action").and_then(|a| a.as_str());
            let reply = match action {
                Some("execute") => {
                    let code = command
                        .get("code")
                        .and_then(|c| c.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.handle_execute(&code)
                }
                Some("setup") => {
                    let docs: Vec<Value> = command
                        .get("context")
                        .and_then(|c| c.as_array())
                        .map(|items| {
                            items
                                .iter()
                                .map(|d| Value::Str(d.as_str().unwrap_or_default().to_string()))
                                .collect()
                        })
                        .unwrap_or_default();
                    self.ns.insert("context".to_string(), Value::List(docs));
                    json!({"status": "ok"})
                }
                Some("reset") => {
                    self.ns.clear();
                    register_builtins(&mut self.ns);
                    json!({"status": "ok"})
                }
                Some("ping") => json!({"status": "ok", "message": "pong"}),
                other => json!({
                    "status": "error",
                    "error": format!("Unknown action: {}", other.unwrap_or("None")),
                }),
            };
            self.io.write_message(&reply)?;
        }
        Ok(())
    }

    fn handle_execute(&mut self, code: &str) -> Json {
        let result = {
            let mut bridge = IoBridge { io: &mut self.io };
            run_program(code, &mut self.ns, &mut bridge)
        };

        let mut reply = json!({
            "status": if result.error.is_some() { "error" } else { "ok" },
            "stdout": result.stdout,
            "stderr": "",
            "return_value": Json::Null,
            "error": result.error,
            "vars": list_user_vars(&self.ns),
        });

        match result.final_marker {
            Some(FinalMarker::Answer(value)) => {
                reply["final_answer"] = final_to_json(&value);
            }
            Some(FinalMarker::Var { name, value }) => {
                reply["final_var"] = json!(name);
                reply["final_value"] = json!(value);
            }
            None => {}
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(value: &Json) -> Vec<u8> {
        let payload = serde_json::to_vec(value).unwrap();
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend(payload);
        out
    }

    fn parse_frames(bytes: &[u8]) -> Vec<Json> {
        let mut io = FramedIo::new(Cursor::new(bytes.to_vec()), std::io::sink());
        let mut replies = Vec::new();
        while let Ok(Some(reply)) = io.read_message() {
            replies.push(reply);
        }
        replies
    }

    fn run_session(frames: Vec<Json>) -> Vec<Json> {
        let mut input = Vec::new();
        for value in &frames {
            input.extend(frame(value));
        }
        let mut output = Vec::new();
        let mut runner = Runner::new(Cursor::new(input), &mut output);
        runner.run().unwrap();
        drop(runner);
        parse_frames(&output)
    }

    #[test]
    fn test_ping_replies_pong() {
        let replies = run_session(vec![json!({"action": "ping"})]);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["status"], "ok");
        assert_eq!(replies[0]["message"], "pong");
    }

    #[test]
    fn test_setup_binds_context() {
        let replies = run_session(vec![
            json!({"action": "setup", "context": ["doc one", "doc two"]}),
            json!({"action": "execute", "code": "print(len(context), context[0])"}),
        ]);
        assert_eq!(replies[0]["status"], "ok");
        assert_eq!(replies[1]["status"], "ok");
        assert_eq!(replies[1]["stdout"], "2 doc one\n");
    }

    #[test]
    fn test_execute_reports_vars() {
        let replies = run_session(vec![
            json!({"action": "execute", "code": "x = 42\nname = \"hi\""}),
        ]);
        assert_eq!(replies[0]["vars"]["x"], "int");
        assert_eq!(replies[0]["vars"]["name"], "str");
    }

    #[test]
    fn test_execute_error_keeps_loop_running() {
        let replies = run_session(vec![
            json!({"action": "execute", "code": "print(nope)"}),
            json!({"action": "ping"}),
        ]);
        assert_eq!(replies[0]["status"], "error");
        assert!(
            replies[0]["error"]
                .as_str()
                .unwrap()
                .contains("undefined name")
        );
        assert_eq!(replies[1]["message"], "pong");
    }

    #[test]
    fn test_execute_final_answer_in_reply() {
        let replies = run_session(vec![
            json!({"action": "execute", "code": "FINAL(\"Hello\")"}),
        ]);
        assert_eq!(replies[0]["status"], "ok");
        assert_eq!(replies[0]["final_answer"], "Hello");
    }

    #[test]
    fn test_execute_final_scalars_travel_natively() {
        let replies = run_session(vec![
            json!({"action": "execute", "code": "FINAL(0)"}),
            json!({"action": "execute", "code": "FINAL(False)"}),
        ]);
        assert_eq!(replies[0]["final_answer"], 0);
        assert_eq!(replies[1]["final_answer"], false);
    }

    #[test]
    fn test_execute_final_var_in_reply() {
        let replies = run_session(vec![json!({
            "action": "execute",
            "code": "answer = \"human being\"\nFINAL_VAR(\"answer\")",
        })]);
        assert_eq!(replies[0]["final_var"], "answer");
        assert_eq!(replies[0]["final_value"], "human being");
    }

    #[test]
    fn test_reset_clears_user_vars_keeps_builtins() {
        let replies = run_session(vec![
            json!({"action": "execute", "code": "x = 1"}),
            json!({"action": "reset"}),
            json!({
                "action": "execute",
                "code": "print(callable(FINAL), callable(llm_query))",
            }),
        ]);
        assert_eq!(replies[1]["status"], "ok");
        assert_eq!(replies[2]["status"], "ok");
        assert_eq!(replies[2]["stdout"], "True True\n");
        assert_eq!(replies[2]["vars"], json!({}));
    }

    #[test]
    fn test_unknown_action_error_reply() {
        let replies = run_session(vec![json!({"action": "dance"})]);
        assert_eq!(replies[0]["status"], "error");
        assert_eq!(replies[0]["error"], "Unknown action: dance");
    }

    #[test]
    fn test_missing_action_reports_none() {
        let replies = run_session(vec![json!({"code": "x"})]);
        assert_eq!(replies[0]["error"], "Unknown action: None");
    }

    #[test]
    fn test_undecodable_frame_exits_loop() {
        let mut input = frame(&json!({"action": "ping"}));
        // A frame whose payload is not JSON.
        let garbage = b"\x00\x00\x00\x03abc";
        input.extend_from_slice(garbage);
        input.extend(frame(&json!({"action": "ping"})));

        let mut output = Vec::new();
        let mut runner = Runner::new(Cursor::new(input), &mut output);
        runner.run().unwrap();
        drop(runner);

        // Only the first ping was answered; the loop exited fail-closed.
        let replies = parse_frames(&output);
        assert_eq!(replies.len(), 1);
    }

    #[test]
    fn test_llm_query_round_trip_over_stream() {
        let replies = run_session(vec![
            json!({"action": "execute", "code": "print(llm_query(\"summarize\", \"data\"))"}),
            json!({"action": "llm_response", "result": "a summary"}),
        ]);
        // First written message is the llm_query request, then the reply.
        assert_eq!(replies[0]["action"], "llm_query");
        assert_eq!(replies[0]["instruction"], "summarize");
        assert_eq!(replies[0]["content"], "data");
        assert_eq!(replies[1]["status"], "ok");
        assert_eq!(replies[1]["stdout"], "a summary\n");
    }

    #[test]
    fn test_llm_query_error_reply_raises_in_guest() {
        let replies = run_session(vec![
            json!({"action": "execute", "code": "llm_query(\"i\", \"c\")"}),
            json!({"action": "llm_response", "error": "No LLM query handler configured"}),
        ]);
        assert_eq!(replies[1]["status"], "error");
        assert!(
            replies[1]["error"]
                .as_str()
                .unwrap()
                .contains("No LLM query handler configured")
        );
    }

    #[test]
    fn test_llm_query_batched_round_trip() {
        let replies = run_session(vec![
            json!({"action": "execute", "code": "print(llm_query_batched([\"a\", \"b\"]))"}),
            json!({"action": "llm_batch_response", "results": ["r1", "r2"]}),
        ]);
        assert_eq!(replies[0]["action"], "llm_query_batch");
        assert_eq!(replies[0]["prompts"], json!(["a", "b"]));
        assert_eq!(replies[1]["stdout"], "['r1', 'r2']\n");
    }

    #[test]
    fn test_context_survives_execute_but_not_reset() {
        let replies = run_session(vec![
            json!({"action": "setup", "context": ["doc"]}),
            json!({"action": "execute", "code": "print(len(context))"}),
            json!({"action": "reset"}),
            json!({"action": "execute", "code": "print(len(context))"}),
        ]);
        assert_eq!(replies[1]["stdout"], "1\n");
        // After reset, context is gone until the next setup.
        assert_eq!(replies[3]["status"], "error");
    }
}
