use bytes::BytesMut;
use tokio::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

// Each direction starts with a 1k buffer and grows as the connection proves
// itself to be high-traffic. TLS records max out at 16k; leave room for a
// frame header.
const INITIAL_BUFFER_SIZE: usize = 1024;
const LARGE_BUFFER_SIZE: usize = 16_384 - 64;
const JUMBO_BUFFER_SIZE: usize = (16 * 16_384) - 64;
// After 128k of transfer, move from INITIAL to LARGE; after 10Mb, to JUMBO.
const RESIZE_THRESHOLD_LARGE: u64 = 128 * 1024;
const RESIZE_THRESHOLD_JUMBO: u64 = 10 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
	#[error("send: {0}")]
	Send(io::Error),

	#[error("receive: {0}")]
	Receive(io::Error),

	#[error("while closing connection: {0}")]
	Shutdown(io::Error),
}

/// Relays bytes in both directions until both sides reach EOF or either
/// errors. Returns (client-to-remote, remote-to-client) byte totals.
///
/// Peer-initiated teardown (RST, half-close races) is not an error: a TCP
/// connection may drop at any time, and callers only care about failures to
/// reach the other end at all.
pub async fn copy_bidirectional<A, B>(downstream: A, upstream: B) -> Result<(u64, u64), RelayError>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let (mut rd, mut wd) = io::split(downstream);
	let (mut ru, mut wu) = io::split(upstream);

	let send = async {
		let res = ignore_io_errors(copy_with_resize(&mut rd, &mut wu).await).map_err(RelayError::Send);
		ignore_shutdown_errors(wu.shutdown().await).map_err(RelayError::Shutdown)?;
		res
	};
	let receive = async {
		let res =
			ignore_io_errors(copy_with_resize(&mut ru, &mut wd).await).map_err(RelayError::Receive);
		ignore_shutdown_errors(wd.shutdown().await).map_err(RelayError::Shutdown)?;
		res
	};

	// join!, not try_join!: when one direction finishes we still drain the
	// other, so a half-closed connection keeps flowing.
	let (sent, received) = tokio::join!(send, receive);
	let (sent, received) = (sent?, received?);
	trace!(sent, received, "copy complete");
	Ok((sent, received))
}

async fn copy_with_resize<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
	let mut buffer_size = INITIAL_BUFFER_SIZE;
	let mut amt: u64 = 0;
	loop {
		buf.reserve(buffer_size);
		let n = reader.read_buf(&mut buf).await?;
		if n == 0 {
			writer.flush().await?;
			return Ok(amt);
		}
		let chunk = buf.split().freeze();
		writer.write_all(&chunk).await?;

		let old = amt;
		amt += n as u64;
		if old < RESIZE_THRESHOLD_LARGE && RESIZE_THRESHOLD_LARGE <= amt {
			buffer_size = LARGE_BUFFER_SIZE;
		}
		if old < RESIZE_THRESHOLD_JUMBO && RESIZE_THRESHOLD_JUMBO <= amt {
			buffer_size = JUMBO_BUFFER_SIZE;
		}
	}
}

fn ignore_io_errors(res: io::Result<u64>) -> io::Result<u64> {
	use io::ErrorKind::*;
	match &res {
		Err(e) => match e.kind() {
			NotConnected | UnexpectedEof | ConnectionReset | BrokenPipe => {
				trace!(err=%e, "io terminated ungracefully");
				Ok(0)
			},
			_ => res,
		},
		_ => res,
	}
}

fn ignore_shutdown_errors(res: io::Result<()>) -> io::Result<()> {
	match &res {
		Err(e)
			if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::UnexpectedEof =>
		{
			trace!(err=%e, "peer already shut down");
			Ok(())
		},
		_ => res,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	#[tokio::test]
	async fn relays_both_directions() {
		let (client, client_far) = tokio::io::duplex(64);
		let (server, server_far) = tokio::io::duplex(64);

		let relay = tokio::spawn(copy_bidirectional(client_far, server_far));

		let (mut client, mut server) = (client, server);
		client.write_all(b"ping").await.unwrap();
		let mut buf = [0u8; 4];
		server.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");

		server.write_all(b"pong!").await.unwrap();
		let mut buf = [0u8; 5];
		client.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"pong!");

		drop(client);
		drop(server);
		let (sent, received) = relay.await.unwrap().unwrap();
		assert_eq!(sent, 4);
		assert_eq!(received, 5);
	}

	#[tokio::test]
	async fn eof_on_one_side_closes_cleanly() {
		let (mut client, client_far) = tokio::io::duplex(64);
		let (mut server, server_far) = tokio::io::duplex(64);

		let relay = tokio::spawn(copy_bidirectional(client_far, server_far));

		client.write_all(b"done").await.unwrap();
		client.shutdown().await.unwrap();

		let mut out = Vec::new();
		server.read_to_end(&mut out).await.unwrap();
		assert_eq!(out, b"done");
		server.shutdown().await.unwrap();

		relay.await.unwrap().unwrap();
	}
}
