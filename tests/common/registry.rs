use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tiny_http::{Header, Method, Request, Response, Server};
use undock::{
    manifests::{ImageIndex, ImageManifest},
    Digest, MediaType, Platform,
};

use super::blobs::Blob;

/// Image to serve from the registry.
pub struct TestImage {
    /// Platform in the index. If there is a single image without
    /// platform, the tag points to its manifest.
    pub platform: Option<Platform>,
    pub config: Blob,
    pub layers: Vec<Blob>,
}

impl TestImage {
    pub fn new(platform: Option<&str>, layers: Vec<Blob>) -> Self {
        TestImage {
            platform: platform.map(|p| p.parse().unwrap()),
            config: Blob::new(MediaType::OciConfig, r#"{"test": true}"#),
            layers,
        }
    }
}

pub struct RegistryHandle {
    pub port: u16,

    /// Digest of the manifest for the tag.
    pub digest: Digest,

    blob_requests: Arc<AtomicUsize>,
}

impl RegistryHandle {
    /// Number of `GET` requests for blobs.
    pub fn blob_requests(&self) -> usize {
        self.blob_requests.load(Ordering::SeqCst)
    }

    pub fn reference(&self, repository: &str, tag: &str) -> String {
        format!("127.0.0.1:{}/{repository}:{tag}", self.port)
    }
}

/// Start a registry server in a random port.
pub fn start_registry(
    repository: &'static str,
    tag: &'static str,
    images: Vec<TestImage>,
) -> RegistryHandle {
    let server = Server::http("127.1:0").expect("start registry server");
    let port = server.server_addr().to_ip().unwrap().port();

    let mut registry = Registry {
        server,
        manifests_prefix: format!("/v2/{repository}/manifests/"),
        blobs_prefix: format!("/v2/{repository}/blobs/"),
        tag,
        tag_manifest: None,
        content: HashMap::new(),
        blob_requests: Arc::new(AtomicUsize::new(0)),
    };

    let digest = registry.add_images(images);

    let handle = RegistryHandle {
        port,
        digest,
        blob_requests: registry.blob_requests.clone(),
    };

    std::thread::spawn(move || registry.run());

    handle
}

struct Registry {
    server: Server,
    manifests_prefix: String,
    blobs_prefix: String,
    tag: &'static str,
    tag_manifest: Option<Digest>,
    content: HashMap<String, (MediaType, Vec<u8>)>,
    blob_requests: Arc<AtomicUsize>,
}

impl Registry {
    fn add(&mut self, blob: &Blob) {
        self.content
            .insert(blob.digest.to_string(), (blob.media_type, blob.data.clone()));
    }

    /// Add the manifests and blobs of the images, and return the digest
    /// of the manifest for the tag.
    fn add_images(&mut self, images: Vec<TestImage>) -> Digest {
        let mut descriptors = Vec::new();

        for image in &images {
            self.add(&image.config);
            image.layers.iter().for_each(|l| self.add(l));

            let manifest = ImageManifest {
                schema_version: 2,
                media_type: Some(MediaType::OciManifestV1.to_string()),
                config: image.config.descriptor(),
                layers: image.layers.iter().map(Blob::descriptor).collect(),
            };

            let manifest = Blob::new(MediaType::OciManifestV1, serde_json::to_vec(&manifest).unwrap());
            self.add(&manifest);

            let mut descriptor = manifest.descriptor();
            descriptor.platform = image.platform.clone();
            descriptors.push(descriptor);
        }

        let single = images.len() == 1 && images[0].platform.is_none();

        let digest = if single {
            descriptors.remove(0).digest
        } else {
            let index = ImageIndex {
                schema_version: 2,
                media_type: Some(MediaType::OciImageIndex.to_string()),
                manifests: descriptors,
            };

            let index = Blob::new(MediaType::OciImageIndex, serde_json::to_vec(&index).unwrap());
            self.add(&index);
            index.digest
        };

        self.tag_manifest = Some(digest.clone());
        digest
    }

    fn run(mut self) {
        let timeout = Duration::from_secs(30);

        while let Ok(Some(request)) = self.server.recv_timeout(timeout) {
            self.handle(request);
        }
    }

    fn handle(&mut self, request: Request) {
        let head = match request.method() {
            Method::Get => false,
            Method::Head => true,
            _ => return not_found(request),
        };

        let url = request.url().to_owned();

        let key = if let Some(reference) = url.strip_prefix(&self.manifests_prefix) {
            match (reference == self.tag, &self.tag_manifest) {
                (true, Some(digest)) => digest.to_string(),
                _ => reference.to_owned(),
            }
        } else if let Some(digest) = url.strip_prefix(&self.blobs_prefix) {
            if !head {
                self.blob_requests.fetch_add(1, Ordering::SeqCst);
            }

            digest.to_owned()
        } else {
            return not_found(request);
        };

        let Some((media_type, data)) = self.content.get(&key) else {
            return not_found(request);
        };

        let body = if head { Vec::new() } else { data.clone() };

        let response = Response::from_data(body)
            .with_header(Header::from_bytes("Content-Type", media_type.as_str()).unwrap())
            .with_header(Header::from_bytes("Docker-Content-Digest", key.as_str()).unwrap());

        request.respond(response).expect("Send response");
    }
}

fn not_found(request: Request) {
    let response = Response::from_string("Not Found").with_status_code(404);
    request.respond(response).expect("Send response");
}
