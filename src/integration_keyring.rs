//! Keyring helpers for catalog credentials.

use keyring::Entry;

const SPOTIFY_SERVICE_NAME: &str = "radiosync.spotify";

fn spotify_entry(client_id: &str) -> Result<Entry, String> {
    Entry::new(SPOTIFY_SERVICE_NAME, client_id)
        .map_err(|err| format!("failed to create keyring entry: {err}"))
}

/// Saves the Spotify refresh token for a client id into the OS keyring.
pub fn set_refresh_token(client_id: &str, refresh_token: &str) -> Result<(), String> {
    let entry = spotify_entry(client_id)?;
    entry
        .set_password(refresh_token)
        .map_err(|err| format!("failed to store refresh token in keyring: {err}"))
}

/// Loads the Spotify refresh token for a client id from the OS keyring.
pub fn get_refresh_token(client_id: &str) -> Result<Option<String>, String> {
    let entry = spotify_entry(client_id)?;
    match entry.get_password() {
        Ok(refresh_token) => Ok(Some(refresh_token)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(format!("failed to read refresh token from keyring: {err}")),
    }
}
