//! Raw bidirectional passthrough between two streams.

use tokio::io::copy_bidirectional;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use shunt_core::error::{ParseError, ParseResult};

use crate::parser::BoxedStream;

/// Forward bytes verbatim in both directions until either side closes
/// or the scope is cancelled. Clean closes are not errors.
pub async fn duplex_pipe(
    mut a: BoxedStream,
    mut b: BoxedStream,
    cancel: &CancellationToken,
) -> ParseResult<()> {
    tokio::select! {
        res = copy_bidirectional(&mut a, &mut b) => match res {
            Ok((up, down)) => {
                debug!(up, down, "passthrough pipe closed");
                Ok(())
            }
            Err(e) => {
                let err = ParseError::Io(e);
                if err.is_benign() { Ok(()) } else { Err(err) }
            }
        },
        _ = cancel.cancelled() => {
            debug!("passthrough pipe cancelled");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn pipe_forwards_both_directions() {
        let (client_near, mut client_far) = tokio::io::duplex(64);
        let (dest_near, mut dest_far) = tokio::io::duplex(64);

        let cancel = CancellationToken::new();
        let pipe = tokio::spawn(async move {
            duplex_pipe(Box::new(client_near), Box::new(dest_near), &cancel).await
        });

        client_far.write_all(b"ping").await.unwrap();
        let mut buf = vec![0u8; 4];
        dest_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");

        dest_far.write_all(b"pong").await.unwrap();
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");

        drop(client_far);
        drop(dest_far);
        pipe.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_the_pipe() {
        let (client_near, _client_far) = tokio::io::duplex(64);
        let (dest_near, _dest_far) = tokio::io::duplex(64);

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let pipe = tokio::spawn(async move {
            duplex_pipe(Box::new(client_near), Box::new(dest_near), &child).await
        });

        cancel.cancel();
        pipe.await.unwrap().unwrap();
    }
}
