//! Synchronous calls over a [`Channel`].
//!
//! The wait loop is the dispatch loop: after sending a call the sender keeps
//! receiving, returns on the matching reply and hands every other inbound
//! message to `dispatch` before waiting again. Nested calls made from inside
//! `dispatch` drain their own replies first, so a reply that does not match the
//! innermost outstanding call means the channel lost framing.
use crate::config::types::{Result, VmError};
use crate::ipc::channel::Channel;
use crate::ipc::message::{encode_payload, split_id, Frame, Message, Reader};
use std::time::Instant;

/// Send `M` and block until its reply, servicing inbound messages meanwhile.
pub fn call<M, F>(channel: &Channel, args: &M::Args, dispatch: F) -> Result<M::Reply>
where
    M: Message,
    F: FnMut(Frame) -> Result<()>,
{
    call_until::<M, F>(channel, args, None, dispatch)?.ok_or_else(|| {
        VmError::ChannelBroken(format!("{}: call ended without reply", channel.label()))
    })
}

/// `call` with an optional deadline. `Ok(None)` means the deadline passed.
pub fn call_until<M, F>(
    channel: &Channel,
    args: &M::Args,
    deadline: Option<Instant>,
    mut dispatch: F,
) -> Result<Option<M::Reply>>
where
    M: Message,
    F: FnMut(Frame) -> Result<()>,
{
    let tag = channel.next_tag();
    channel.send(Frame::call(M::ID, tag, encode_payload(args)?))?;

    loop {
        let frame = match channel.recv_deadline(deadline)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        if frame.is_reply() {
            if frame.id == M::ID && frame.call_tag() == tag {
                return Reader::from(frame).read().map(Some);
            }
            let (major, minor) = split_id(frame.id);
            return Err(VmError::Protocol(format!(
                "reply {}:{} tag {} does not match outstanding call tag {}",
                major,
                minor,
                frame.call_tag(),
                tag
            )));
        }
        dispatch(frame)?;
    }
}

/// Send `M` without waiting for a reply.
pub fn notify<M: Message>(channel: &Channel, args: &M::Args) -> Result<()> {
    channel.send(Frame::one_way(M::ID, encode_payload(args)?))
}

/// Receive until `accept` matches a frame, dispatching everything else.
///
/// Returns `Ok(None)` when `deadline` passes first.
pub fn wait_for<P, F>(
    channel: &Channel,
    deadline: Instant,
    mut accept: P,
    mut dispatch: F,
) -> Result<Option<Frame>>
where
    P: FnMut(&Frame) -> bool,
    F: FnMut(Frame) -> Result<()>,
{
    loop {
        let frame = match channel.recv_deadline(Some(deadline))? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        if accept(&frame) {
            return Ok(Some(frame));
        }
        if frame.is_reply() {
            return Err(VmError::Protocol(format!(
                "unsolicited reply for message {:#010x}",
                frame.id
            )));
        }
        dispatch(frame)?;
    }
}

/// Decode `M`'s arguments, run `handler` and answer if the sender waits.
pub fn handle_msg<M, H>(channel: &Channel, reader: Reader, handler: H) -> Result<()>
where
    M: Message,
    H: FnOnce(M::Args) -> Result<M::Reply>,
{
    let args = reader.read::<M::Args>()?;
    let reply = handler(args)?;
    if reader.expects_reply() {
        channel.send(reader.reply_frame(&reply)?)?;
    }
    Ok(())
}
