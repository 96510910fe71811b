//! In-memory data behind the reference backend: doctors, tokens, patients, chats,
//! messages and uploaded files. Nothing is persisted.

use axum::http::StatusCode;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Error answer: status plus plain-text body.
pub type Failure = (StatusCode, String);

fn fail(status: StatusCode, msg: &str) -> Failure {
    (status, msg.to_string())
}

fn now_iso() -> String {
    chrono::Utc::now()
        .naive_utc()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

fn gen_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut h = Sha256::new();
    h.update(salt.as_bytes());
    h.update(password.as_bytes());
    format!("{:x}", h.finalize())
}

#[derive(Debug, Clone)]
struct Doctor {
    id: String,
    email: String,
    name: String,
    salt: String,
    password_hash: String,
}

#[derive(Debug, Clone)]
struct PatientRow {
    id: String,
    doctor_id: String,
    name: String,
    mrn: Option<String>,
    notes: Option<String>,
    created_at: String,
}

#[derive(Debug, Clone)]
struct ChatRow {
    id: String,
    doctor_id: String,
    patient_id: Option<String>,
    patient_name: Option<String>,
    title: String,
    is_general: bool,
    created_at: String,
}

#[derive(Debug, Clone)]
struct MessageRow {
    id: String,
    chat_id: String,
    role: String,
    text: String,
    media_url: Option<String>,
    media_type: Option<String>,
    created_at: String,
}

/// An uploaded file held in memory.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct Db {
    doctors: Vec<Doctor>,
    tokens: HashMap<String, String>,
    patients: Vec<PatientRow>,
    chats: Vec<ChatRow>,
    messages: Vec<MessageRow>,
    files: HashMap<String, StoredFile>,
}

impl Db {
    fn doctor(&self, id: &str) -> Option<&Doctor> {
        self.doctors.iter().find(|d| d.id == id)
    }

    fn issue_token(&mut self, doctor_id: &str) -> String {
        let token = format!("tok-{}", uuid::Uuid::new_v4().simple());
        self.tokens.insert(token.clone(), doctor_id.to_string());
        token
    }

    fn chat(&self, doctor_id: &str, chat_id: &str) -> Option<&ChatRow> {
        self.chats
            .iter()
            .find(|c| c.id == chat_id && c.doctor_id == doctor_id)
    }
}

/// Shared state of the reference backend. Clones share data.
#[derive(Clone)]
pub struct BackendState {
    db: Arc<RwLock<Db>>,
    token_delay: Duration,
}

impl Default for BackendState {
    fn default() -> Self {
        Self::new()
    }
}

fn patient_json(p: &PatientRow) -> Value {
    json!({ "id": p.id, "name": p.name, "mrn": p.mrn, "notes": p.notes, "created_at": p.created_at })
}

fn chat_json(c: &ChatRow) -> Value {
    json!({
        "id": c.id,
        "title": c.title,
        "patient_id": c.patient_id,
        "patient_name": c.patient_name,
        "is_general": c.is_general,
        "created_at": c.created_at,
    })
}

fn message_json(m: &MessageRow) -> Value {
    json!({
        "id": m.id,
        "role": m.role,
        "text": m.text,
        "media_url": m.media_url,
        "media_type": m.media_type,
        "created_at": m.created_at,
    })
}

/// Classify an attachment URL by extension.
fn media_type_for(url: &str) -> &'static str {
    let lower = url.to_lowercase();
    if [".jpg", ".jpeg", ".png", ".gif", ".webp"].iter().any(|e| lower.contains(e)) {
        "image"
    } else if [".webm", ".wav", ".mp3", ".m4a"].iter().any(|e| lower.contains(e)) {
        "audio"
    } else {
        "file"
    }
}

/// Best-effort MIME type from a file name.
pub fn guess_mime(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "webm" => "audio/webm",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

impl BackendState {
    pub fn new() -> Self {
        Self {
            db: Arc::new(RwLock::new(Db::default())),
            token_delay: Duration::ZERO,
        }
    }

    /// Pause between streamed tokens, to make the stream visibly incremental.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn token_delay(&self) -> Duration {
        self.token_delay
    }

    /// Doctor id behind a bearer token.
    pub async fn authenticate(&self, token: &str) -> Result<String, Failure> {
        self.db
            .read()
            .await
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| fail(StatusCode::UNAUTHORIZED, "Invalid token"))
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<Value, Failure> {
        let mut db = self.db.write().await;
        if db.doctors.iter().any(|d| d.email == email) {
            return Err(fail(StatusCode::CONFLICT, "Email exists"));
        }
        let salt = gen_id();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| email.split('@').next().unwrap_or(email).to_string());
        let doctor = Doctor {
            id: gen_id(),
            email: email.to_string(),
            name,
            password_hash: hash_password(&salt, password),
            salt,
        };
        let token = db.issue_token(&doctor.id);
        let out = json!({ "token": token, "doctor_id": doctor.id, "name": doctor.name });
        db.doctors.push(doctor);
        log::info!("registered doctor {}", email);
        Ok(out)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Value, Failure> {
        let mut db = self.db.write().await;
        let doctor = db
            .doctors
            .iter()
            .find(|d| d.email == email && d.password_hash == hash_password(&d.salt, password))
            .cloned()
            .ok_or_else(|| fail(StatusCode::UNAUTHORIZED, "Invalid credentials"))?;
        let token = db.issue_token(&doctor.id);
        Ok(json!({ "token": token, "doctor_id": doctor.id, "name": doctor.name }))
    }

    pub async fn refresh(&self, doctor_id: &str) -> Result<Value, Failure> {
        let mut db = self.db.write().await;
        let doctor = db
            .doctor(doctor_id)
            .cloned()
            .ok_or_else(|| fail(StatusCode::UNAUTHORIZED, "Invalid token"))?;
        let token = db.issue_token(&doctor.id);
        Ok(json!({ "token": token, "doctor_id": doctor.id, "name": doctor.name }))
    }

    pub async fn me(&self, doctor_id: &str) -> Result<Value, Failure> {
        let db = self.db.read().await;
        let d = db
            .doctor(doctor_id)
            .ok_or_else(|| fail(StatusCode::UNAUTHORIZED, "Invalid token"))?;
        Ok(json!({ "doctor_id": d.id, "name": d.name, "email": d.email }))
    }

    pub async fn create_patient(
        &self,
        doctor_id: &str,
        name: &str,
        mrn: Option<String>,
        notes: Option<String>,
    ) -> Result<Value, Failure> {
        if name.trim().is_empty() {
            return Err(fail(StatusCode::UNPROCESSABLE_ENTITY, "Patient name is required"));
        }
        let row = PatientRow {
            id: gen_id(),
            doctor_id: doctor_id.to_string(),
            name: name.to_string(),
            mrn,
            notes,
            created_at: now_iso(),
        };
        let out = patient_json(&row);
        self.db.write().await.patients.push(row);
        Ok(out)
    }

    pub async fn list_patients(&self, doctor_id: &str) -> Value {
        let db = self.db.read().await;
        let rows: Vec<Value> = db
            .patients
            .iter()
            .rev()
            .filter(|p| p.doctor_id == doctor_id)
            .map(patient_json)
            .collect();
        Value::Array(rows)
    }

    pub async fn patient_profile(&self, doctor_id: &str, patient_id: &str) -> Result<Value, Failure> {
        let db = self.db.read().await;
        let patient = db
            .patients
            .iter()
            .find(|p| p.id == patient_id && p.doctor_id == doctor_id)
            .ok_or_else(|| fail(StatusCode::NOT_FOUND, "Patient not found"))?;
        let chats: Vec<&ChatRow> = db
            .chats
            .iter()
            .rev()
            .filter(|c| c.doctor_id == doctor_id && c.patient_id.as_deref() == Some(patient_id))
            .collect();
        let messages: Vec<&MessageRow> = db
            .messages
            .iter()
            .rev()
            .filter(|m| chats.iter().any(|c| c.id == m.chat_id))
            .collect();
        let recent: Vec<Value> = messages
            .iter()
            .take(10)
            .map(|m| {
                let text = if m.text.chars().count() > 200 {
                    format!("{}...", m.text.chars().take(200).collect::<String>())
                } else {
                    m.text.clone()
                };
                json!({ "id": m.id, "role": m.role, "text": text, "chat_id": m.chat_id, "created_at": m.created_at })
            })
            .collect();
        let files: Vec<Value> = messages
            .iter()
            .filter_map(|m| {
                m.media_url.as_ref().map(|url| {
                    json!({
                        "id": m.id,
                        "media_url": url,
                        "media_type": m.media_type,
                        "file_name": url.rsplit('/').next(),
                        "chat_id": m.chat_id,
                        "created_at": m.created_at,
                    })
                })
            })
            .collect();
        Ok(json!({
            "patient": patient_json(patient),
            "chats": chats.iter().map(|c| chat_json(c)).collect::<Vec<_>>(),
            "recent_messages": recent,
            "files": files,
        }))
    }

    /// Delete a patient; their chats become unlinked.
    pub async fn delete_patient(&self, doctor_id: &str, patient_id: &str) -> Result<Value, Failure> {
        let mut db = self.db.write().await;
        let before = db.patients.len();
        db.patients
            .retain(|p| !(p.id == patient_id && p.doctor_id == doctor_id));
        if db.patients.len() == before {
            return Err(fail(StatusCode::NOT_FOUND, "Patient not found"));
        }
        for c in db.chats.iter_mut().filter(|c| c.patient_id.as_deref() == Some(patient_id)) {
            c.patient_id = None;
        }
        Ok(json!({ "ok": true }))
    }

    pub async fn create_chat(
        &self,
        doctor_id: &str,
        patient_id: Option<&str>,
        title: &str,
    ) -> Result<Value, Failure> {
        let mut db = self.db.write().await;
        let patient_name = match patient_id {
            Some(pid) => Some(
                db.patients
                    .iter()
                    .find(|p| p.id == pid && p.doctor_id == doctor_id)
                    .map(|p| p.name.clone())
                    .ok_or_else(|| fail(StatusCode::NOT_FOUND, "Patient not found"))?,
            ),
            None => None,
        };
        let row = ChatRow {
            id: gen_id(),
            doctor_id: doctor_id.to_string(),
            patient_id: patient_id.map(str::to_string),
            patient_name,
            title: title.to_string(),
            is_general: patient_id.is_none(),
            created_at: now_iso(),
        };
        let out = chat_json(&row);
        db.chats.push(row);
        Ok(out)
    }

    pub async fn list_chats(&self, doctor_id: &str, patient_id: Option<&str>, general_only: bool) -> Value {
        let db = self.db.read().await;
        let rows: Vec<Value> = db
            .chats
            .iter()
            .rev()
            .filter(|c| c.doctor_id == doctor_id)
            .filter(|c| patient_id.is_none() || c.patient_id.as_deref() == patient_id)
            .filter(|c| !general_only || c.is_general)
            .map(chat_json)
            .collect();
        Value::Array(rows)
    }

    pub async fn list_messages(&self, doctor_id: &str, chat_id: &str) -> Result<Value, Failure> {
        let db = self.db.read().await;
        db.chat(doctor_id, chat_id)
            .ok_or_else(|| fail(StatusCode::NOT_FOUND, "Chat not found"))?;
        let rows: Vec<Value> = db
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .map(message_json)
            .collect();
        Ok(Value::Array(rows))
    }

    /// Record the user's message and compose the assistant reply for a chat.
    pub async fn begin_reply(
        &self,
        doctor_id: &str,
        chat_id: &str,
        prompt: &str,
        image_url: Option<String>,
    ) -> Result<String, Failure> {
        let mut db = self.db.write().await;
        let chat = db
            .chat(doctor_id, chat_id)
            .cloned()
            .ok_or_else(|| fail(StatusCode::NOT_FOUND, "Chat not found"))?;
        let media_type = image_url.as_deref().map(|u| media_type_for(u).to_string());
        db.messages.push(MessageRow {
            id: gen_id(),
            chat_id: chat_id.to_string(),
            role: "user".to_string(),
            text: prompt.to_string(),
            media_url: image_url,
            media_type,
            created_at: now_iso(),
        });
        let context = match chat.patient_name {
            Some(name) => format!("Consulting on {}. ", name),
            None => "General consultation. ".to_string(),
        };
        Ok(frame_safe(&format!("{}You asked: {}", context, prompt)))
    }

    /// Persist the assistant reply once streaming finished. Blank replies are not stored.
    pub async fn finish_reply(&self, chat_id: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.db.write().await.messages.push(MessageRow {
            id: gen_id(),
            chat_id: chat_id.to_string(),
            role: "assistant".to_string(),
            text: text.to_string(),
            media_url: None,
            media_type: None,
            created_at: now_iso(),
        });
    }

    /// Store an upload; returns the name it is served under (/storage/<name>).
    pub async fn store_file(&self, doctor_id: &str, file_name: &str, bytes: Vec<u8>) -> String {
        let ext = file_name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        let short = uuid::Uuid::new_v4().simple().to_string();
        let stored = format!("{}_{}.{}", doctor_id, &short[..8], ext);
        let file = StoredFile {
            mime_type: guess_mime(file_name).to_string(),
            bytes,
        };
        self.db.write().await.files.insert(stored.clone(), file);
        stored
    }

    pub async fn file(&self, name: &str) -> Option<StoredFile> {
        self.db.read().await.files.get(name).cloned()
    }
}

/// Reply text that survives `data: <token>\n\n` framing: runs of line breaks collapse to
/// one and trailing line breaks are dropped. A payload may neither contain `\n\n` nor end
/// with `\n`, so a blank line cannot be carried.
fn frame_safe(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\n' && out.ends_with('\n') {
            continue;
        }
        out.push(c);
    }
    out.truncate(out.trim_end_matches('\n').len());
    out
}

/// Split a reply into stream tokens: words with their trailing space. A line break starts
/// a new token, so no token ends with `\n` unless the reply does.
pub fn tokenize(reply: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in reply.chars() {
        if c == '\n' && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        current.push(c);
        if c == ' ' {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
