use super::connection::Connection;

/// Receives inbound data and the disconnect notice of a
/// [`PeerConnection`](super::PeerConnection).
///
/// Both methods run on the thread that owns the connection's readiness loop,
/// except `disconnected`, which runs on whichever thread called
/// `PeerConnection::disconnect`. Calls never overlap: `receive_data` calls
/// arrive one at a time in arrival order, and `disconnected` is the last call
/// ever made for a connection.
pub trait ServerListener<A>: Send + Sync + 'static {
    /// Fired exactly once per connection, before the socket is closed, so
    /// the implementation may still try a final write.
    fn disconnected(&self);

    /// Fired for every read that yields at least one byte.
    ///
    /// `data` borrows the loop's read buffer and is only valid for the
    /// duration of the call; `bytes_read == data.len()`. A logical message may
    /// arrive split over several calls.
    fn receive_data(&self, conn: &mut Connection<A>, bytes_read: usize, data: &[u8]);
}
