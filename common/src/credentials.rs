use log::debug;

use crate::{
    hal::{PlatformError, Storage},
    types::{StoredCredentials, MAX_PASSWORD_LEN, MAX_SSID_LEN},
};

pub const CREDENTIAL_MAGIC: u8 = 0xA5;
pub const RECORD_SIZE: usize = 1 + MAX_SSID_LEN + MAX_PASSWORD_LEN;

const MAGIC_ADDR: usize = 0;
const SSID_ADDR: usize = 1;
const PASSWORD_ADDR: usize = SSID_ADDR + MAX_SSID_LEN;

/// Fixed-layout record: marker byte, 32-byte SSID, 64-byte password,
/// both NUL padded.
pub struct CredentialStore<S: Storage> {
    storage: S,
    initialized: bool,
}

impl<S: Storage> CredentialStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            initialized: false,
        }
    }

    fn begin(&mut self) -> Result<(), PlatformError> {
        if self.initialized {
            return Ok(());
        }
        self.storage.begin(RECORD_SIZE)?;
        self.initialized = true;
        Ok(())
    }

    /// `None` for a virgin store, a foreign marker or an empty SSID alike.
    pub fn load(&mut self) -> Option<StoredCredentials> {
        if let Err(err) = self.begin() {
            debug!("credential storage unavailable: {err}");
            return None;
        }

        if self.storage.read(MAGIC_ADDR) != CREDENTIAL_MAGIC {
            return None;
        }

        let ssid = self.read_field(SSID_ADDR, MAX_SSID_LEN);
        let password = self.read_field(PASSWORD_ADDR, MAX_PASSWORD_LEN);
        let creds = StoredCredentials::new(&ssid, &password);
        creds.is_valid().then_some(creds)
    }

    pub fn save(&mut self, creds: &StoredCredentials) -> Result<(), PlatformError> {
        self.begin()?;
        self.storage.write(MAGIC_ADDR, CREDENTIAL_MAGIC);
        self.write_field(SSID_ADDR, MAX_SSID_LEN, creds.ssid().as_bytes());
        self.write_field(PASSWORD_ADDR, MAX_PASSWORD_LEN, creds.password().as_bytes());
        self.storage.commit()
    }

    pub fn clear(&mut self) -> Result<(), PlatformError> {
        self.begin()?;
        for addr in 0..RECORD_SIZE {
            self.storage.write(addr, 0);
        }
        self.storage.commit()
    }

    fn read_field(&self, start: usize, len: usize) -> String {
        let bytes: Vec<u8> = (start..start + len)
            .map(|addr| self.storage.read(addr))
            .take_while(|byte| *byte != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn write_field(&mut self, start: usize, len: usize, value: &[u8]) {
        for offset in 0..len {
            let byte = value.get(offset).copied().unwrap_or(0);
            self.storage.write(start + offset, byte);
        }
    }
}
