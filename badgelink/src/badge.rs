use bytes::Buf;
use log::{debug, info, warn};

use crate::accumulator::{AppEntry, DirectoryEntry, EntryKind};
use crate::codec::{Opcode, Packet, Tag, TokenCommand};
use crate::config::LinkConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ErrorKind, ProtocolError};
use crate::transport::Transport;

/// Reply to a directory request of the structured family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirListing {
    pub dir: String,
    pub files: Vec<String>,
    pub dirs: Vec<String>,
}

impl DirListing {
    /// Parse `dir\n{f|d}name\n...`
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload).map_err(|err| {
            ProtocolError::InvalidPayload(format!("directory listing: {err}"))
        })?;
        let mut lines = text.split('\n');
        let mut listing = DirListing {
            dir: lines.next().unwrap_or_default().to_string(),
            ..Default::default()
        };
        for line in lines {
            if let Some(name) = line.strip_prefix('f') {
                listing.files.push(name.to_string());
            } else if let Some(name) = line.strip_prefix('d') {
                listing.dirs.push(name.to_string());
            } else if !line.is_empty() {
                warn!("Ignoring listing line {line:?}");
            }
        }
        Ok(listing)
    }
}

/// User level operations on a badge
pub struct Badge<T: Transport> {
    dispatcher: Dispatcher<T>,
}

impl<T: Transport> Badge<T> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        Badge {
            dispatcher: Dispatcher::new(transport, config),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<T> {
        &mut self.dispatcher
    }

    pub fn into_transport(self) -> T {
        self.dispatcher.into_transport()
    }

    // Structured family

    /// Returns whatever the badge answers
    pub fn heartbeat(&mut self) -> Result<String, ProtocolError> {
        let packet = self.dispatcher.call_packet(Opcode::Heartbeat, vec![])?;
        Ok(String::from_utf8_lossy(&packet.payload).into_owned())
    }

    pub fn execute_file(&mut self, path: &str) -> Result<(), ProtocolError> {
        self.request_ok(Opcode::ExecFile, path.as_bytes().to_vec())
    }

    /// Boot an installed app
    pub fn app_boot(&mut self, name: &str) -> Result<(), ProtocolError> {
        self.request_ok(Opcode::AppBoot, terminated(name))
    }

    pub fn get_dir(&mut self, path: &str) -> Result<DirListing, ProtocolError> {
        let packet = self
            .dispatcher
            .call_packet(Opcode::GetDir, path.as_bytes().to_vec())?;
        check_failure(&packet)?;
        DirListing::parse(&packet.payload)
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, ProtocolError> {
        let packet = self
            .dispatcher
            .call_packet(Opcode::ReadFile, path.as_bytes().to_vec())?;
        check_failure(&packet)?;
        debug!("Read {} bytes from {path}", packet.payload.len());
        Ok(packet.payload)
    }

    pub fn write_file<F>(
        &mut self,
        path: &str,
        data: &[u8],
        progress: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(usize, usize),
    {
        let mut payload = terminated(path);
        payload.extend_from_slice(data);
        let packet = self.dispatcher.call_packet_with_progress(
            Opcode::WriteFile,
            payload,
            progress,
        )?;
        expect_ok(&packet)
    }

    pub fn delete_file(&mut self, path: &str) -> Result<(), ProtocolError> {
        self.request_ok(Opcode::DeleteFile, path.as_bytes().to_vec())
    }

    pub fn duplicate_file(
        &mut self,
        source: &str,
        destination: &str,
    ) -> Result<(), ProtocolError> {
        self.request_ok(Opcode::DuplicateFile, pair(source, destination))
    }

    pub fn move_file(
        &mut self,
        source: &str,
        destination: &str,
    ) -> Result<(), ProtocolError> {
        self.request_ok(Opcode::MoveFile, pair(source, destination))
    }

    pub fn make_dir(&mut self, path: &str) -> Result<(), ProtocolError> {
        self.request_ok(Opcode::MakeDir, path.as_bytes().to_vec())
    }

    pub fn list_apps(&mut self) -> Result<Vec<AppEntry>, ProtocolError> {
        let packet = self.dispatcher.call_packet(Opcode::ListApps, vec![])?;
        check_failure(&packet)?;
        parse_apps(&packet.payload)
    }

    pub fn delete_app(&mut self, name: &str) -> Result<(), ProtocolError> {
        self.request_ok(Opcode::DeleteApp, terminated(name))
    }

    pub fn write_app<F>(
        &mut self,
        name: &str,
        data: &[u8],
        progress: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(usize, usize),
    {
        let mut payload = terminated(name);
        payload.extend_from_slice(data);
        let packet = self.dispatcher.call_packet_with_progress(
            Opcode::WriteApp,
            payload,
            progress,
        )?;
        expect_ok(&packet)
    }

    fn request_ok(
        &mut self,
        opcode: Opcode,
        payload: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let packet = self.dispatcher.call_packet(opcode, payload)?;
        expect_ok(&packet)
    }

    // Token family

    pub fn wusb_list_apps(&mut self) -> Result<Vec<AppEntry>, ProtocolError> {
        self.sync()?;
        let reply = self.dispatcher.call_token(TokenCommand::ListApps)?;
        Ok(reply.apps().cloned().collect())
    }

    pub fn wusb_list_dir(
        &mut self,
        path: &str,
    ) -> Result<Vec<(EntryKind, DirectoryEntry)>, ProtocolError> {
        self.sync()?;
        let reply = self.dispatcher.call_token(TokenCommand::ListDir {
            path: path.to_string(),
        })?;
        Ok(reply
            .entries()
            .map(|(kind, entry)| (kind, entry.clone()))
            .collect())
    }

    /// Install an app, booting it right away when `run` is set
    pub fn wusb_install_app<F>(
        &mut self,
        name: &str,
        data: &[u8],
        run: bool,
        progress: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(usize, usize),
    {
        self.sync()?;
        info!("Installing {name} ({} bytes)", data.len());
        let command = TokenCommand::InstallApp {
            name: name.to_string(),
            data: data.to_vec(),
            run,
        };
        self.dispatcher.call_token_with_progress(command, progress)?;
        Ok(())
    }

    pub fn wusb_remove_app(&mut self, name: &str) -> Result<(), ProtocolError> {
        self.sync()?;
        self.dispatcher.call_token(TokenCommand::RemoveApp {
            name: name.to_string(),
        })?;
        Ok(())
    }

    // the badge announces an idle session with a bare WUSB
    fn sync(&mut self) -> Result<(), ProtocolError> {
        let timeout = self.dispatcher.config().timeout;
        self.dispatcher.synchronize(Tag::WUSB, timeout)
    }
}

fn terminated(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 1);
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    out
}

fn pair(first: &str, second: &str) -> Vec<u8> {
    let mut out = terminated(first);
    out.extend_from_slice(second.as_bytes());
    out
}

fn check_failure(packet: &Packet) -> Result<(), ProtocolError> {
    match ErrorKind::from_reply(&packet.payload) {
        Some(kind) => Err(ProtocolError::Device(kind)),
        None => Ok(()),
    }
}

fn expect_ok(packet: &Packet) -> Result<(), ProtocolError> {
    check_failure(packet)?;
    if packet.payload != b"ok" {
        return Err(ProtocolError::InvalidPayload(format!(
            "unexpected status {:?}",
            String::from_utf8_lossy(&packet.payload)
        )));
    }
    Ok(())
}

/// `u32 count`, then `u32 size | u32 name_len | name` per app
fn parse_apps(mut payload: &[u8]) -> Result<Vec<AppEntry>, ProtocolError> {
    let truncated =
        || ProtocolError::InvalidPayload("truncated app list".to_string());

    if payload.remaining() < 4 {
        return Err(truncated());
    }
    let count = payload.get_u32_le();
    let mut apps = Vec::new();
    for _ in 0..count {
        if payload.remaining() < 8 {
            return Err(truncated());
        }
        let size = payload.get_u32_le();
        let name_len = payload.get_u32_le() as usize;
        if payload.remaining() < name_len {
            return Err(truncated());
        }
        let name = String::from_utf8_lossy(&payload[..name_len]).into_owned();
        payload.advance(name_len);
        apps.push(AppEntry {
            name,
            fid: None,
            size: Some(size),
        });
    }
    if payload.has_remaining() {
        debug!("{} bytes after app list", payload.remaining());
    }
    Ok(apps)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::codec::{FRAME_HEADER_LEN, Request};
    use crate::transport::mock::ScriptedTransport;

    fn reply(opcode: Opcode, message_id: u32, payload: &[u8]) -> Vec<u8> {
        Request::new(opcode, message_id, payload.to_vec()).encode()
    }

    fn badge(inbound: Vec<Vec<u8>>, config: LinkConfig) -> Badge<ScriptedTransport> {
        let config = config
            .with_chunk_delay(Duration::ZERO)
            .with_poll_interval(Duration::ZERO)
            .with_timeout(Duration::from_millis(200));
        Badge::new(ScriptedTransport::new().with_fragments(inbound), config)
    }

    #[test]
    fn test_get_dir() {
        let mut badge = badge(
            vec![reply(Opcode::GetDir, 7, b"/apps\nfone.bin\ndtest")],
            LinkConfig::default(),
        );
        for _ in 0..6 {
            badge.dispatcher_mut().next_message_id();
        }
        let listing = badge.get_dir("/apps").unwrap();
        assert_eq!(
            listing,
            DirListing {
                dir: "/apps".into(),
                files: vec!["one.bin".into()],
                dirs: vec!["test".into()],
            }
        );

        let writes = badge.dispatcher().transport().writes();
        assert_eq!(
            writes[0],
            [0x00, 0x10, 5, 0, 0, 0, 0xde, 0xad, 7, 0, 0, 0]
        );
        assert_eq!(writes[1], b"/apps");
    }

    #[test]
    fn test_empty_listing() {
        assert_eq!(
            DirListing::parse(b"/sd").unwrap(),
            DirListing {
                dir: "/sd".into(),
                ..Default::default()
            }
        );
        assert!(DirListing::parse(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_status_replies() {
        let mut badge = badge(
            vec![
                reply(Opcode::DeleteFile, 1, b"ok"),
                reply(Opcode::DeleteFile, 2, b"er"),
                reply(Opcode::MakeDir, 3, b"ns"),
                reply(Opcode::MakeDir, 4, b"??"),
            ],
            LinkConfig::default(),
        );
        badge.delete_file("/a").unwrap();
        assert!(matches!(
            badge.delete_file("/a"),
            Err(ProtocolError::Device(ErrorKind::Failure))
        ));
        assert!(matches!(
            badge.make_dir("/b"),
            Err(ProtocolError::Device(ErrorKind::NotSupported))
        ));
        assert!(matches!(
            badge.make_dir("/b"),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_move_payload() {
        let mut badge = badge(
            vec![reply(Opcode::MoveFile, 1, b"ok")],
            LinkConfig::default(),
        );
        badge.move_file("/sd/a.txt", "/sd/b.txt").unwrap();
        assert_eq!(
            badge.dispatcher().transport().writes()[1],
            b"/sd/a.txt\0/sd/b.txt"
        );
    }

    #[test]
    fn test_read_file() {
        let mut badge = badge(
            vec![
                reply(Opcode::ReadFile, 1, b"print('hi')\n"),
                reply(Opcode::ReadFile, 2, b"er"),
            ],
            LinkConfig::default(),
        );
        assert_eq!(badge.read_file("/sd/main.py").unwrap(), b"print('hi')\n");
        assert!(matches!(
            badge.read_file("/sd/missing.py"),
            Err(ProtocolError::Device(ErrorKind::Failure))
        ));
    }

    #[test]
    fn test_list_apps() {
        let mut payload = 2u32.to_le_bytes().to_vec();
        for (size, name) in [(4096u32, "snake"), (123, "demo")] {
            payload.extend_from_slice(&size.to_le_bytes());
            payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
            payload.extend_from_slice(name.as_bytes());
        }
        let mut badge = badge(
            vec![reply(Opcode::ListApps, 1, &payload)],
            LinkConfig::default(),
        );
        let apps = badge.list_apps().unwrap();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].name, "snake");
        assert_eq!(apps[0].size, Some(4096));
        assert_eq!(apps[1].name, "demo");

        assert!(parse_apps(&payload[..payload.len() - 1]).is_err());
        assert!(parse_apps(&[]).is_err());
    }

    #[test]
    fn test_install_app() {
        let mut badge = badge(
            [b"WUSB", b"OKOK", b"APOW", b"OKOK", b"WUSB"]
                .map(|f| f.to_vec())
                .to_vec(),
            LinkConfig::webusb(),
        );
        let data = vec![0xa5; 10 * 1024];
        let mut last = (0, 0);
        badge
            .wusb_install_app("demo", &data, false, |sent, total| {
                last = (sent, total)
            })
            .unwrap();

        let writes = badge.dispatcher().transport().writes();
        let body_len = 4 + 4 + 4 + 1 + data.len();
        assert_eq!(writes[0].len(), FRAME_HEADER_LEN);
        assert_eq!(&writes[0][..4], b"WUSB");
        assert_eq!(writes.len(), 1 + body_len.div_ceil(512));
        assert!(writes[1..writes.len() - 1].iter().all(|w| w.len() == 512));
        assert_eq!(&writes[1][..12], b"APOW\x04\0\0\0demo");
        assert_eq!(last, (body_len, body_len));
    }

    #[test]
    fn test_install_app_failure() {
        let mut badge = badge(
            vec![b"WUSB".to_vec(), b"OKOKAPOWEAPW".to_vec()],
            LinkConfig::webusb(),
        );
        assert!(matches!(
            badge.wusb_install_app("demo", b"\x00", true, |_, _| {}),
            Err(ProtocolError::Device(ErrorKind::WriteFailed))
        ));
    }

    #[test]
    fn test_list_dir_tokens() {
        let mut reply = b"OKOKFSLSOKOK".to_vec();
        for (tag, name, size) in [(b"DIRR", "apps", 0u32), (b"FILE", "a.py", 77)] {
            reply.extend_from_slice(tag);
            reply.extend_from_slice(&(name.len() as u32).to_le_bytes());
            reply.extend_from_slice(name.as_bytes());
            reply.extend_from_slice(&size.to_le_bytes());
            reply.extend_from_slice(&1_650_000_000u32.to_le_bytes());
        }
        reply.extend_from_slice(b"WUSB");

        let mut badge = badge(
            vec![b"WUSB".to_vec(), reply[..20].to_vec(), reply[20..].to_vec()],
            LinkConfig::webusb(),
        );
        let entries = badge.wusb_list_dir("/internal").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, EntryKind::Directory);
        assert_eq!(entries[0].1.name, "apps");
        assert_eq!(entries[1].0, EntryKind::File);
        assert_eq!(entries[1].1.size, 77);
    }

    #[test]
    fn test_no_session() {
        let mut badge = badge(vec![b"booting".to_vec()], LinkConfig::webusb());
        assert!(matches!(
            badge.wusb_remove_app("demo"),
            Err(ProtocolError::SyncTimeout(_))
        ));
        assert!(badge.dispatcher().transport().writes().is_empty());
    }
}
