//! Client for the `com.apple.mobile.mobile_image_mounter` service.
//!
//! The service mounts signed disk images, such as the developer disk image
//! that enables debugging and UI automation. Images are uploaded to a fixed
//! staging path before being mounted.

use async_trait::async_trait;
use plist::{Dictionary, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument};

use crate::codec::PlistChannel;
use crate::error::{LockdownError, MobileImageMounterError, Result};

/// The image mounter service name.
pub const IMAGE_MOUNTER_SERVICE: &str = "com.apple.mobile.mobile_image_mounter";

/// Image type of the developer disk image.
pub const DEVELOPER_IMAGE_TYPE: &str = "Developer";

/// Where uploaded images are staged on the device.
pub const STAGING_PATH: &str = "/private/var/mobile/Media/PublicStaging/staging.dimage";

/// Operations of the image mounter service.
#[async_trait]
pub trait ImageMounter: Send {
    /// Return the signatures of mounted images of the given type. An empty
    /// list means no image of that type is mounted.
    async fn lookup_image(&mut self, image_type: &str) -> Result<Vec<Vec<u8>>>;

    /// Upload an image and its signature to the staging path.
    async fn upload_image(&mut self, image_type: &str, image: &[u8], signature: &[u8])
        -> Result<()>;

    /// Mount the staged image.
    async fn mount_image(&mut self, image_type: &str, signature: &[u8]) -> Result<()>;

    /// End the service session.
    async fn hangup(&mut self) -> Result<()>;
}

/// An image mounter service connection.
#[derive(Debug)]
pub struct MobileImageMounterClient<S> {
    channel: PlistChannel<S>,
}

impl<S> MobileImageMounterClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a stream connected to the service port.
    pub fn new(stream: S) -> Self {
        Self {
            channel: PlistChannel::new(stream),
        }
    }

    async fn command(&mut self, command: &str, fields: Dictionary) -> Result<Dictionary> {
        let mut request = fields;
        request.insert("Command".to_string(), Value::String(command.to_string()));
        self.channel.exchange(&request).await
    }
}

/// Fail unless the response carries `expected` as its status.
fn expect_status(command: &str, response: &Dictionary, expected: &str) -> Result<()> {
    let status = response.get("Status").and_then(Value::as_string);
    if status == Some(expected) {
        return Ok(());
    }

    let status = status
        .or_else(|| response.get("Error").and_then(Value::as_string))
        .unwrap_or("no status")
        .to_string();
    Err(MobileImageMounterError {
        command: command.to_string(),
        status,
    }
    .into())
}

#[async_trait]
impl<S> ImageMounter for MobileImageMounterClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[instrument(skip(self))]
    async fn lookup_image(&mut self, image_type: &str) -> Result<Vec<Vec<u8>>> {
        let mut fields = Dictionary::new();
        fields.insert("ImageType".to_string(), Value::String(image_type.to_string()));
        let response = self.command("LookupImage", fields).await?;

        if let Some(error) = response.get("Error").and_then(Value::as_string) {
            return Err(MobileImageMounterError {
                command: "LookupImage".to_string(),
                status: error.to_string(),
            }
            .into());
        }

        // Older devices send a single data value, newer ones an array.
        let signatures = match response.get("ImageSignature") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_data)
                .map(<[u8]>::to_vec)
                .collect(),
            Some(Value::Data(data)) if !data.is_empty() => vec![data.clone()],
            _ => Vec::new(),
        };
        debug!(count = signatures.len(), "Looked up mounted images");
        Ok(signatures)
    }

    #[instrument(skip(self, image, signature), fields(size = image.len()))]
    async fn upload_image(
        &mut self,
        image_type: &str,
        image: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("ImageType".to_string(), Value::String(image_type.to_string()));
        fields.insert("ImageSignature".to_string(), Value::Data(signature.to_vec()));
        fields.insert(
            "ImageSize".to_string(),
            Value::Integer((image.len() as u64).into()),
        );

        let ack = self.command("ReceiveBytes", fields).await?;
        expect_status("ReceiveBytes", &ack, "ReceiveBytesAck")?;

        self.channel.send_raw(image).await?;
        let done = self.channel.receive().await?;
        expect_status("ReceiveBytes", &done, "Complete")?;
        debug!("Image uploaded");
        Ok(())
    }

    #[instrument(skip(self, signature))]
    async fn mount_image(&mut self, image_type: &str, signature: &[u8]) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("ImagePath".to_string(), Value::String(STAGING_PATH.to_string()));
        fields.insert("ImageSignature".to_string(), Value::Data(signature.to_vec()));
        fields.insert("ImageType".to_string(), Value::String(image_type.to_string()));

        let response = self.command("MountImage", fields).await?;
        expect_status("MountImage", &response, "Complete")
    }

    async fn hangup(&mut self) -> Result<()> {
        match self.command("Hangup", Dictionary::new()).await {
            Ok(_) | Err(LockdownError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Mock image mounter for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{async_trait, ImageMounter, MobileImageMounterError, Result};

    /// State shared between a mock mounter and the test that created it.
    #[derive(Debug, Default)]
    pub struct MockImageState {
        /// Signatures returned by `lookup_image`.
        pub mounted: Vec<Vec<u8>>,
        /// Images uploaded, as `(image type, size, signature)`.
        pub uploads: Vec<(String, usize, Vec<u8>)>,
        /// Signatures passed to `mount_image`.
        pub mounts: Vec<Vec<u8>>,
        /// When set, `mount_image` fails with this status.
        pub mount_status: Option<String>,
        /// Number of hangups.
        pub hangups: usize,
    }

    /// Mock image mounter recording every call.
    #[derive(Debug, Clone, Default)]
    pub struct MockImageMounter {
        state: Arc<Mutex<MockImageState>>,
    }

    impl MockImageMounter {
        /// Create a mock with no image mounted.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a mock that reports an image as already mounted.
        #[must_use]
        pub fn with_mounted(signature: Vec<u8>) -> Self {
            let mock = Self::default();
            mock.state.lock().mounted.push(signature);
            mock
        }

        /// Make `mount_image` fail with `status`.
        pub fn fail_mount(&self, status: &str) {
            self.state.lock().mount_status = Some(status.to_string());
        }

        /// Access the recorded state.
        pub fn state(&self) -> parking_lot::MutexGuard<'_, MockImageState> {
            self.state.lock()
        }
    }

    #[async_trait]
    impl ImageMounter for MockImageMounter {
        async fn lookup_image(&mut self, _image_type: &str) -> Result<Vec<Vec<u8>>> {
            Ok(self.state.lock().mounted.clone())
        }

        async fn upload_image(
            &mut self,
            image_type: &str,
            image: &[u8],
            signature: &[u8],
        ) -> Result<()> {
            self.state
                .lock()
                .uploads
                .push((image_type.to_string(), image.len(), signature.to_vec()));
            Ok(())
        }

        async fn mount_image(&mut self, _image_type: &str, signature: &[u8]) -> Result<()> {
            let mut state = self.state.lock();
            if let Some(status) = &state.mount_status {
                return Err(MobileImageMounterError {
                    command: "MountImage".to_string(),
                    status: status.clone(),
                }
                .into());
            }
            state.mounts.push(signature.to_vec());
            state.mounted.push(signature.to_vec());
            Ok(())
        }

        async fn hangup(&mut self) -> Result<()> {
            self.state.lock().hangups += 1;
            Ok(())
        }
    }
}
