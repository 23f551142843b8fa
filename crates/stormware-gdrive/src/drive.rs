//! Google Drive connector addressing files by [`DrivePath`].
//!
//! API base: `https://www.googleapis.com/drive/v3`
//!
//! Drive itself is ID based and allows duplicate names in a folder. Paths are
//! resolved component by component; a component that matches more than one
//! file is rejected instead of guessed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use stormware_gcp::{scopes, GcpAuth, GcpClient};

use crate::error::{DriveError, DriveErrorKind, DriveResult};
use crate::path::DrivePath;

const SERVICE: &str = "drive";
const FILES: &str = "/drive/v3/files";
const DRIVES: &str = "/drive/v3/drives";
const UPLOAD: &str = "/upload/drive/v3/files";

pub const MIME_TYPE_FOLDER: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Deserialize)]
struct FileEntry {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct DriveList {
    #[serde(default)]
    drives: Vec<FileEntry>,
}

/// Escape a value embedded in a Drive search query.
pub(crate) fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

// ── Log messages ────────────────────────────────────────────────────────

/// Describes a lookup for debug and info logs.
#[derive(Debug, Default, Clone, Copy)]
struct Describe<'a> {
    folders: Option<bool>,
    name: Option<&'a str>,
    parent_id: Option<&'a str>,
    drive_id: Option<&'a str>,
    in_trash: Option<bool>,
}

impl Describe<'_> {
    fn message(&self, prefix: &str) -> String {
        let mut message = prefix.to_string();
        match self.folders {
            Some(true) => message.push_str(" folder"),
            Some(false) => message.push_str(" file"),
            None => {}
        }
        if let Some(name) = self.name.filter(|n| !n.is_empty()) {
            message.push_str(&format!(" \"{}\"", name));
        }
        if let Some(parent_id) = self.parent_id.filter(|p| !p.is_empty()) {
            message.push_str(&format!(" with parent \"{}\"", parent_id));
        }
        if let Some(drive_id) = self.drive_id.filter(|d| !d.is_empty()) {
            message.push_str(&format!(" in drive \"{}\"", drive_id));
        }
        match self.in_trash {
            Some(true) => message.push_str(" in trash"),
            Some(false) => message.push_str(" not in trash"),
            None => {}
        }
        message
    }
}

// ── Drive ───────────────────────────────────────────────────────────────

/// Google Drive connector.
///
/// The credentials must be authorized for the
/// `https://www.googleapis.com/auth/drive` scope.
#[derive(Debug)]
pub struct Drive {
    client: GcpClient,
    drive_ids: Mutex<HashMap<String, String>>,
}

impl Drive {
    pub fn new(client: GcpClient) -> Self {
        Self {
            client,
            drive_ids: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(
        auth: &GcpAuth,
        organization: Option<&str>,
        project: Option<&str>,
    ) -> DriveResult<Self> {
        let client = auth
            .client(organization, project, &[scopes::DRIVE])
            .await?;
        Ok(Self::new(client))
    }

    /// ID of a shared drive, or of the user's root folder for `""`.
    pub(crate) async fn drive_id(&self, name: &str) -> DriveResult<String> {
        if let Some(id) = self.drive_ids.lock().await.get(name) {
            return Ok(id.clone());
        }

        let drive_id = if name.is_empty() {
            debug!("Loading drive ID of the user's root drive");
            let root: FileEntry = self
                .client
                .get(SERVICE, &format!("{}/root", FILES), &[("fields", "id")])
                .await?;
            root.id
        } else {
            debug!("Loading drive ID of shared drive \"{}\"", name);
            let query = format!("name = '{}'", escape_query(name));
            let list: DriveList = self.client.get(SERVICE, DRIVES, &[("q", query.as_str())]).await?;
            match list.drives.as_slice() {
                [] => {
                    return Err(DriveError::not_found(format!(
                        "Shared drive \"{}\" not found",
                        name
                    )))
                }
                [drive] => drive.id.clone(),
                _ => {
                    return Err(DriveError::not_unique(format!(
                        "Shared drive name \"{}\" is not unique",
                        name
                    )))
                }
            }
        };

        debug!("Drive ID: {}", drive_id);
        self.drive_ids
            .lock()
            .await
            .insert(name.to_string(), drive_id.clone());
        Ok(drive_id)
    }

    /// Shared drive ID for queries, `None` for the user's drive.
    async fn corpus(&self, path: &DrivePath) -> DriveResult<Option<String>> {
        if path.drive().is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.drive_id(path.drive()).await?))
        }
    }

    /// Children of `parent_id` grouped by name.
    pub(crate) async fn file_ids(
        &self,
        parent_id: &str,
        name: Option<&str>,
        drive_id: Option<&str>,
        folders: Option<bool>,
        in_trash: Option<bool>,
    ) -> DriveResult<HashMap<String, Vec<String>>> {
        debug!(
            "{}",
            Describe {
                folders,
                name,
                parent_id: Some(parent_id),
                drive_id,
                in_trash,
            }
            .message("Loading file IDs of")
        );

        let mut query = format!("'{}' in parents", escape_query(parent_id));
        if let Some(name) = name {
            query.push_str(&format!(" and name = '{}'", escape_query(name)));
        }
        if let Some(folders) = folders {
            query.push_str(&format!(
                " and mimeType {} '{}'",
                if folders { "=" } else { "!=" },
                MIME_TYPE_FOLDER
            ));
        }
        if let Some(in_trash) = in_trash {
            query.push_str(&format!(" and trashed = {}", in_trash));
        }

        let fields = if name.is_some() {
            "nextPageToken, files(id)"
        } else {
            "nextPageToken, files(id, name)"
        };
        let mut params: Vec<(&str, String)> = vec![
            ("corpora", if drive_id.is_some() { "drive" } else { "user" }.to_string()),
            ("q", query),
            ("spaces", "drive".to_string()),
            ("fields", fields.to_string()),
            ("supportsAllDrives", "true".to_string()),
            ("includeItemsFromAllDrives", drive_id.is_some().to_string()),
        ];
        if let Some(drive_id) = drive_id {
            params.push(("driveId", drive_id.to_string()));
        }

        let files: Vec<FileEntry> = self
            .client
            .get_all_pages(SERVICE, FILES, &params, "files")
            .await?;

        let mut ids: HashMap<String, Vec<String>> = HashMap::new();
        match name {
            Some(name) => {
                if !files.is_empty() {
                    ids.insert(name.to_string(), files.into_iter().map(|f| f.id).collect());
                }
                debug!("File IDs: {:?}", ids);
            }
            None => {
                for file in files {
                    ids.entry(file.name).or_default().push(file.id);
                }
            }
        }
        Ok(ids)
    }

    /// ID of the file at `path`, `None` when any component is missing.
    pub(crate) async fn file_id_by_path(
        &self,
        path: &DrivePath,
        in_trash: bool,
    ) -> DriveResult<Option<String>> {
        debug!(
            "{}",
            Describe {
                name: Some(&path.to_string()),
                in_trash: Some(in_trash),
                ..Default::default()
            }
            .message("Loading file ID of path")
        );
        let drive_id = self.drive_id(path.drive()).await?;
        let corpus = self.corpus(path).await?;
        let components = path.components();
        let mut parent_id = drive_id;

        for (index, part) in components.iter().enumerate() {
            let last = index + 1 == components.len();
            let ids = self
                .file_ids(
                    &parent_id,
                    Some(part),
                    corpus.as_deref(),
                    // Only folders can have children
                    if last { None } else { Some(true) },
                    // Intermediate folders of a trashed file may still be live
                    match (in_trash, last) {
                        (false, _) => Some(false),
                        (true, false) => None,
                        (true, true) => Some(true),
                    },
                )
                .await?;
            let Some(ids) = ids.get(part.as_str()).filter(|ids| !ids.is_empty()) else {
                return Ok(None);
            };
            if ids.len() > 1 {
                return Err(DriveError::not_unique(format!(
                    "Name \"{}\" is not unique in path \"{}\"",
                    part, path
                )));
            }
            parent_id = ids[0].clone();
        }

        debug!("Path file ID: {}", parent_id);
        Ok(Some(parent_id))
    }

    pub(crate) async fn remove_file(&self, file_id: &str, use_trash: bool) -> DriveResult<()> {
        let path = format!("{}/{}", FILES, file_id);
        let query = [("supportsAllDrives", "true")];
        if use_trash {
            debug!("Moving file \"{}\" to trash", file_id);
            let _: serde_json::Value = self
                .client
                .patch(SERVICE, &path, &query, &serde_json::json!({"trashed": true}))
                .await?;
        } else {
            debug!("Deleting file \"{}\"", file_id);
            self.client.delete(SERVICE, &path, &query).await?;
        }
        Ok(())
    }

    pub(crate) async fn create_folder(&self, name: &str, parent_id: &str) -> DriveResult<String> {
        debug!(
            "{}",
            Describe {
                name: Some(name),
                parent_id: Some(parent_id),
                ..Default::default()
            }
            .message("Creating folder")
        );
        let body = serde_json::json!({
            "mimeType": MIME_TYPE_FOLDER,
            "name": name,
            "parents": [parent_id],
        });
        let folder: FileEntry = self
            .client
            .post(
                SERVICE,
                FILES,
                &[("fields", "id"), ("supportsAllDrives", "true")],
                &body,
            )
            .await?;
        debug!("Created folder ID: {}", folder.id);
        Ok(folder.id)
    }

    /// Resolve `path`, creating every missing folder on the way.
    pub(crate) async fn create_folder_at_path(&self, path: &DrivePath) -> DriveResult<String> {
        debug!("Creating folder at path \"{}\"", path);
        let corpus = self.corpus(path).await?;
        let mut parent_id = self.drive_id(path.drive()).await?;
        let mut create = false;

        for part in path.components() {
            if !create {
                let ids = self
                    .file_ids(&parent_id, Some(part), corpus.as_deref(), Some(true), Some(false))
                    .await?;
                match ids.get(part.as_str()).map(Vec::as_slice).unwrap_or_default() {
                    [] => create = true,
                    [id] => parent_id = id.clone(),
                    _ => {
                        return Err(DriveError::not_unique(format!(
                            "Name \"{}\" is not unique in path \"{}\"",
                            part, path
                        )))
                    }
                }
            }
            if create {
                parent_id = self.create_folder(part, &parent_id).await?;
            }
        }

        debug!("Created path file ID: {}", parent_id);
        Ok(parent_id)
    }

    pub(crate) async fn upload_file(&self, src: &Path, parent_id: &str) -> DriveResult<String> {
        debug!("Uploading file \"{}\" to \"{}\"", src.display(), parent_id);
        let name = file_name(src)?;
        let media = tokio::fs::read(src)
            .await
            .map_err(|e| DriveError::io(src, e))?;
        let mime = mime_guess::from_path(src).first_or_octet_stream();
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
        });
        let file: FileEntry = self
            .client
            .post_multipart_related(
                SERVICE,
                UPLOAD,
                &[
                    ("uploadType", "multipart"),
                    ("fields", "id"),
                    ("supportsAllDrives", "true"),
                ],
                &metadata,
                &media,
                mime.essence_str(),
            )
            .await?;
        debug!("Uploaded file ID: {}", file.id);
        Ok(file.id)
    }

    /// Trash same-name files in `dst` or refuse to continue.
    async fn overwrite(
        &self,
        file_ids: &HashMap<String, Vec<String>>,
        name: &str,
        dst: &DrivePath,
        overwrite: bool,
    ) -> DriveResult<()> {
        for file_id in file_ids.get(name).into_iter().flatten() {
            if !overwrite {
                return Err(DriveError::new(
                    DriveErrorKind::AlreadyExists,
                    format!("File \"{}\" already exists", dst / name),
                ));
            }
            info!("Moving existing file \"{}\" to trash", dst / name);
            self.remove_file(file_id, true).await?;
        }
        Ok(())
    }

    async fn upload_file_to_path(&self, src: &Path, dst: &DrivePath, overwrite: bool) -> DriveResult<()> {
        info!("Uploading file \"{}\" to \"{}\"", src.display(), dst);
        let parent_id = self.create_folder_at_path(dst).await?;
        let corpus = self.corpus(dst).await?;
        let name = file_name(src)?;
        debug!("Loading existing file IDs in \"{}\"", dst);
        let file_ids = self
            .file_ids(&parent_id, Some(&name), corpus.as_deref(), None, Some(false))
            .await?;
        self.overwrite(&file_ids, &name, dst, overwrite).await?;
        self.upload_file(src, &parent_id).await?;
        Ok(())
    }

    async fn upload_folder_to_path(&self, src: &Path, dst: &DrivePath, overwrite: bool) -> DriveResult<()> {
        info!("Uploading folder \"{}\" to \"{}\"", src.display(), dst);
        let corpus = self.corpus(dst).await?;
        let base = dst / file_name(src)?;

        for (folder, files) in walk_folders(src)? {
            let relative = folder
                .strip_prefix(src)
                .unwrap_or(Path::new(""))
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            let dst_folder = relative.iter().fold(base.clone(), |path, c| path / c);
            info!("Uploading subfolder \"{}\" to \"{}\"", folder.display(), dst_folder);

            let parent_id = self.create_folder_at_path(&dst_folder).await?;
            debug!("Loading existing file IDs in \"{}\"", dst_folder);
            let file_ids = self
                .file_ids(&parent_id, None, corpus.as_deref(), None, Some(false))
                .await?;
            for file in files {
                let name = file_name(&file)?;
                info!("Uploading file \"{}\" to \"{}\"", file.display(), dst_folder);
                self.overwrite(&file_ids, &name, &dst_folder, overwrite).await?;
                self.upload_file(&file, &parent_id).await?;
            }
        }
        Ok(())
    }

    // ── Public operations ───────────────────────────────────────────

    /// Whether `path` exists (in the trash when `in_trash`).
    pub async fn exists(&self, path: &DrivePath, in_trash: bool) -> DriveResult<bool> {
        info!(
            "{}",
            Describe {
                name: Some(&path.to_string()),
                in_trash: Some(in_trash),
                ..Default::default()
            }
            .message("Checking existence of")
        );
        Ok(self.file_id_by_path(path, in_trash).await?.is_some())
    }

    /// Create a folder at `path`, including parent folders.
    pub async fn mkdir(&self, path: &DrivePath) -> DriveResult<DrivePath> {
        info!("Creating Google Drive folder \"{}\"", path);
        self.create_folder_at_path(path).await?;
        Ok(path.clone())
    }

    /// Remove the file or folder at `path`.
    ///
    /// * `missing_ok` - do not fail when the path does not exist.
    /// * `use_trash` - trash instead of deleting permanently.
    /// * `in_trash` - address files that are already trashed.
    pub async fn remove(
        &self,
        path: &DrivePath,
        missing_ok: bool,
        use_trash: bool,
        in_trash: bool,
    ) -> DriveResult<()> {
        if use_trash {
            info!("Moving Google Drive path \"{}\" to trash", path);
        } else {
            info!("Deleting Google Drive path \"{}\"", path);
        }
        if use_trash && in_trash {
            return Err(DriveError::invalid(
                "The `use_trash` parameter cannot be used together with `in_trash`",
            ));
        }
        if path.parts().len() < 2 {
            return Err(DriveError::invalid(format!("Invalid path \"{}\"", path)));
        }
        match self.file_id_by_path(path, in_trash).await? {
            Some(file_id) => self.remove_file(&file_id, use_trash).await,
            None if missing_ok => Ok(()),
            None => Err(DriveError::not_found(format!(
                "No such file or folder: '{}'",
                path
            ))),
        }
    }

    /// Upload a file or folder into the folder `dst` and return its new path.
    pub async fn upload(&self, src: &Path, dst: &DrivePath, overwrite: bool) -> DriveResult<DrivePath> {
        if !src.exists() {
            return Err(DriveError::invalid(format!(
                "Source path \"{}\" does not exist",
                src.display()
            )));
        }
        if src.is_file() {
            self.upload_file_to_path(src, dst, overwrite).await?;
        } else if src.is_dir() {
            self.upload_folder_to_path(src, dst, overwrite).await?;
        } else {
            return Err(DriveError::invalid(format!(
                "Invalid source path \"{}\"",
                src.display()
            )));
        }
        Ok(dst / file_name(src)?)
    }
}

fn file_name(path: &Path) -> DriveResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DriveError::invalid(format!("Invalid source path \"{}\"", path.display())))
}

/// Every folder below `root` (top-down) with the files it directly contains.
fn walk_folders(root: &Path) -> DriveResult<Vec<(PathBuf, Vec<PathBuf>)>> {
    let mut folders: Vec<(PathBuf, Vec<PathBuf>)> = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            DriveError::io(&path, e.into())
        })?;
        if entry.file_type().is_dir() {
            folders.push((entry.into_path(), Vec::new()));
        } else if entry.file_type().is_file() {
            let parent = entry.path().parent().map(Path::to_path_buf);
            if let Some(folder) = folders.iter_mut().rev().find(|(f, _)| Some(f) == parent.as_ref()) {
                folder.1.push(entry.into_path());
            }
        }
    }
    Ok(folders)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
