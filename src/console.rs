use std::io::{stdout, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::IOError(err) => err,
            Error::JoinError(err) => std::io::Error::new(std::io::ErrorKind::Other, err),
        }
    }
}

pub async fn print(message: &str) -> Result<(), Error> {
    let message = message.to_string();
    tokio::task::spawn_blocking(move || {
        let stdout = stdout();
        let mut stdout = stdout.lock();
        stdout.write_all(message.as_bytes())?;
        stdout.flush()?;
        Ok(())
    })
    .await?
}
