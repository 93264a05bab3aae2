//! File-based IPC (spec §4.9, §6).
//!
//! Root `<project>/<mcp_dir>/<session>/ipc/<agent_id>/`. Each message is a
//! markdown file `<YYYYMMDD_HHMMSS_micro>_<id8>.md` with a YAML front
//! matter block followed by a Markdown body. Writes are atomic (temp file +
//! rename in the target directory).

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::Result;
use crate::models::{sanitize_filename, Message, MessagePriority, MessageType};
use crate::utils::atomic_write;

pub struct IpcStore {
    root: PathBuf,
}

impl IpcStore {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            root: session_dir.join("ipc"),
        }
    }

    fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(sanitize_filename(agent_id, "message"))
    }

    /// Idempotently create the per-agent message directory.
    pub fn register_agent(&self, agent_id: &str) -> Result<()> {
        std::fs::create_dir_all(self.agent_dir(agent_id))?;
        Ok(())
    }

    pub fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        let dir = self.agent_dir(agent_id);
        if dir.is_dir() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn registered_agents(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(out)
    }

    /// Remove the entire IPC directory tree (teardown step 3).
    pub fn cleanup(&self) -> Result<()> {
        if self.root.is_dir() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    fn message_filename(msg: &Message) -> String {
        let ts = msg.created_at.format("%Y%m%d_%H%M%S_%6f");
        let id8: String = msg.id.chars().filter(|c| *c != '-').take(8).collect();
        format!("{ts}_{id8}.md")
    }

    fn write_message(&self, agent_id: &str, msg: &Message) -> Result<()> {
        let dir = self.agent_dir(agent_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(Self::message_filename(msg));
        atomic_write(&path, &render_message(msg)?)
    }

    /// Send one message. `receiver_id == None` fans it out to every
    /// registered agent directory except the sender (§4.9).
    #[allow(clippy::too_many_arguments)]
    pub fn send_message(
        &self,
        sender_id: &str,
        receiver_id: Option<&str>,
        message_type: MessageType,
        content: String,
        subject: String,
        priority: MessagePriority,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Message> {
        let msg = Message::new(
            sender_id.to_string(),
            receiver_id.map(|s| s.to_string()),
            message_type,
            priority,
            subject,
            content,
            metadata,
        );
        match receiver_id {
            Some(receiver) => self.write_message(receiver, &msg)?,
            None => {
                for agent_id in self.registered_agents()? {
                    if agent_id != sender_id {
                        self.write_message(&agent_id, &msg)?;
                    }
                }
            }
        }
        Ok(msg)
    }

    /// Enumerate, parse, sort by `created_at`, optionally filter by
    /// read-state/type, and (if `mark_as_read`) rewrite each unread message
    /// with `read_at = now`.
    pub fn read_messages(
        &self,
        agent_id: &str,
        unread_only: bool,
        message_type: Option<MessageType>,
        mark_as_read: bool,
    ) -> Result<Vec<Message>> {
        let dir = self.agent_dir(agent_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(PathBuf, Message)> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            if let Some(msg) = parse_message(&contents) {
                entries.push((path, msg));
            }
        }
        entries.sort_by_key(|(_, msg)| msg.created_at);

        let mut out = Vec::new();
        for (path, mut msg) in entries {
            if unread_only && !msg.is_unread() {
                continue;
            }
            if let Some(want) = message_type {
                if msg.message_type != want {
                    continue;
                }
            }
            if mark_as_read && msg.is_unread() {
                msg.read_at = Some(Utc::now());
                atomic_write(&path, &render_message(&msg)?)?;
            }
            out.push(msg);
        }
        Ok(out)
    }
}

fn render_message(msg: &Message) -> Result<String> {
    #[derive(serde::Serialize)]
    struct FrontMatter<'a> {
        id: &'a str,
        sender_id: &'a str,
        receiver_id: &'a Option<String>,
        message_type: MessageType,
        priority: MessagePriority,
        subject: &'a str,
        created_at: chrono::DateTime<Utc>,
        read_at: Option<chrono::DateTime<Utc>>,
        metadata: &'a serde_json::Map<String, serde_json::Value>,
    }
    let front = FrontMatter {
        id: &msg.id,
        sender_id: &msg.sender_id,
        receiver_id: &msg.receiver_id,
        message_type: msg.message_type,
        priority: msg.priority,
        subject: &msg.subject,
        created_at: msg.created_at,
        read_at: msg.read_at,
        metadata: &msg.metadata,
    };
    let yaml = serde_yaml::to_string(&front)?;
    Ok(format!("---\n{yaml}---\n{}\n", msg.content))
}

fn parse_message(contents: &str) -> Option<Message> {
    let rest = contents.strip_prefix("---\n")?;
    let end = rest.find("\n---\n")?;
    let (front, body) = rest.split_at(end);
    let body = body.strip_prefix("\n---\n").unwrap_or(body).trim_end_matches('\n');

    #[derive(serde::Deserialize)]
    struct FrontMatter {
        id: String,
        sender_id: String,
        receiver_id: Option<String>,
        message_type: MessageType,
        priority: MessagePriority,
        subject: String,
        created_at: chrono::DateTime<Utc>,
        read_at: Option<chrono::DateTime<Utc>>,
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
    }
    let parsed: FrontMatter = serde_yaml::from_str(front).ok()?;
    Some(Message {
        id: parsed.id,
        sender_id: parsed.sender_id,
        receiver_id: parsed.receiver_id,
        message_type: parsed.message_type,
        priority: parsed.priority,
        subject: parsed.subject,
        content: body.to_string(),
        metadata: parsed.metadata,
        created_at: parsed.created_at,
        read_at: parsed.read_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_read_roundtrips_and_marks_read() {
        let dir = tempfile::tempdir().unwrap();
        let ipc = IpcStore::new(dir.path());
        ipc.register_agent("admin").unwrap();
        ipc.register_agent("worker-1").unwrap();

        ipc.send_message(
            "admin",
            Some("worker-1"),
            MessageType::TaskAssign,
            "do the thing".into(),
            "New task".into(),
            MessagePriority::High,
            serde_json::Map::new(),
        )
        .unwrap();

        let unread = ipc
            .read_messages("worker-1", true, None, true)
            .unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].subject, "New task");
        assert!(unread[0].read_at.is_none(), "returned copy predates the rewrite");

        let second_pass = ipc.read_messages("worker-1", true, None, true).unwrap();
        assert!(second_pass.is_empty());
    }

    #[test]
    fn broadcast_fans_out_to_everyone_but_sender() {
        let dir = tempfile::tempdir().unwrap();
        let ipc = IpcStore::new(dir.path());
        ipc.register_agent("admin").unwrap();
        ipc.register_agent("worker-1").unwrap();
        ipc.register_agent("worker-2").unwrap();

        ipc.send_message(
            "admin",
            None,
            MessageType::Broadcast,
            "stand by".into(),
            "All hands".into(),
            MessagePriority::Normal,
            serde_json::Map::new(),
        )
        .unwrap();

        assert_eq!(ipc.read_messages("worker-1", false, None, false).unwrap().len(), 1);
        assert_eq!(ipc.read_messages("worker-2", false, None, false).unwrap().len(), 1);
        assert!(ipc.read_messages("admin", false, None, false).unwrap().is_empty());
    }

    #[test]
    fn ordered_by_created_at_not_filename() {
        let dir = tempfile::tempdir().unwrap();
        let ipc = IpcStore::new(dir.path());
        ipc.register_agent("worker-1").unwrap();

        let mut early = Message::new(
            "admin".into(),
            Some("worker-1".into()),
            MessageType::StatusUpdate,
            MessagePriority::Normal,
            "first".into(),
            "".into(),
            serde_json::Map::new(),
        );
        early.created_at = Utc::now() - chrono::Duration::seconds(30);
        let dir_path = dir.path().join("ipc").join("worker-1");
        std::fs::create_dir_all(&dir_path).unwrap();
        std::fs::write(dir_path.join("z_early.md"), render_message(&early).unwrap()).unwrap();

        ipc.send_message(
            "admin",
            Some("worker-1"),
            MessageType::StatusUpdate,
            "".into(),
            "second".into(),
            MessagePriority::Normal,
            serde_json::Map::new(),
        )
        .unwrap();

        let msgs = ipc.read_messages("worker-1", false, None, false).unwrap();
        assert_eq!(msgs[0].subject, "first");
        assert_eq!(msgs[1].subject, "second");
    }
}
