//! Channel Tx/Rx engines
//!
//! Each channel owns an engine matching its retransmission mode. Basic mode is the identity:
//! one SDU per PDU out, PDU payload delivered unchanged in. Enhanced Retransmission mode is the
//! windowed go-back-n machine of Vol 3, Part A Section 8: sequence numbered I-frames, RR/RNR
//! acknowledgment, REJ and SREJ recovery, segmented SDU reassembly, and the retransmission and
//! monitor timers.
//!
//! The ERTM engine here is a pure state machine: every input returns the list of
//! [`ErtmAction`]s for the channel to carry out. Timers are owned by the channel, which calls
//! back into the engine when they fire. Frames produced by the engine exclude the frame check
//! sequence; the channel appends and validates it.

use crate::pdu::{ControlField, Segmentation, Supervisory};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::time::Duration;

/// Default timeout of the ERTM retransmission timer
pub const ERTM_RETRANSMISSION_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout of the ERTM monitor timer
pub const ERTM_MONITOR_TIMEOUT: Duration = Duration::from_secs(12);

/// Default limit on transmissions of one I-frame
pub const ERTM_MAX_TRANSMISSIONS: u8 = 4;

/// Default transmit window
pub const ERTM_TX_WINDOW: u8 = 32;

/// Configuration of an ERTM engine
#[derive(Clone, Copy, Debug)]
pub struct ErtmConfig {
    /// Maximum unacknowledged I-frames in flight (1 to 63)
    pub tx_window: u8,
    /// Transmissions of one frame before the link is declared failed
    pub max_transmissions: u8,
    /// Maximum information field of one I-frame
    pub mps: u16,
}

impl Default for ErtmConfig {
    fn default() -> Self {
        ErtmConfig {
            tx_window: ERTM_TX_WINDOW,
            max_transmissions: ERTM_MAX_TRANSMISSIONS,
            mps: 1010,
        }
    }
}

/// An instruction from the engine to its channel
#[derive(Debug, PartialEq, Eq)]
pub enum ErtmAction {
    /// Send a PDU payload (control field and information, no FCS)
    SendFrame(Vec<u8>),
    /// Deliver a complete SDU to the channel's receive callback
    DeliverSdu(Vec<u8>),
    StartRetransmissionTimer,
    StopRetransmissionTimer,
    StartMonitorTimer,
    StopMonitorTimer,
    /// The peer is unresponsive or violated the protocol; close the link
    LinkFailure,
}

struct UnackedFrame {
    tx_seq: u8,
    segmentation: Segmentation,
    information: Vec<u8>,
    transmit_count: u8,
}

/// The Enhanced Retransmission mode engine
pub struct ErtmEngine {
    config: ErtmConfig,

    // transmit side
    next_tx_seq: u8,
    expected_ack_seq: u8,
    pending_segments: VecDeque<(Segmentation, Vec<u8>)>,
    unacked: VecDeque<UnackedFrame>,
    remote_busy: bool,
    retransmission_timer_running: bool,

    // receive side
    expected_tx_seq: u8,
    out_of_order: BTreeMap<u8, (Segmentation, Vec<u8>)>,
    srej_sent: bool,
    reassembly: Option<(usize, Vec<u8>)>,
}

fn seq_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from) % ControlField::SEQ_MODULO
}

fn next_seq(seq: u8) -> u8 {
    (seq + 1) % ControlField::SEQ_MODULO
}

impl ErtmEngine {
    pub fn new(config: ErtmConfig) -> Self {
        ErtmEngine {
            config,
            next_tx_seq: 0,
            expected_ack_seq: 0,
            pending_segments: VecDeque::new(),
            unacked: VecDeque::new(),
            remote_busy: false,
            retransmission_timer_running: false,
            expected_tx_seq: 0,
            out_of_order: BTreeMap::new(),
            srej_sent: false,
            reassembly: None,
        }
    }

    /// Get the number of I-frames awaiting acknowledgment
    pub fn unacked_frames(&self) -> usize {
        self.unacked.len()
    }

    /// Check if segments are waiting on the transmit window
    pub fn has_pending_segments(&self) -> bool {
        !self.pending_segments.is_empty()
    }

    /// Queue an SDU for transmission
    pub fn queue_sdu(&mut self, sdu: Vec<u8>) -> Vec<ErtmAction> {
        let mps = self.config.mps as usize;

        if sdu.len() <= mps {
            self.pending_segments.push_back((Segmentation::Unsegmented, sdu));
        } else {
            // the start segment's information field leads with the total SDU length
            let mut start = Vec::with_capacity(mps);

            start.extend_from_slice(&(sdu.len() as u16).to_le_bytes());
            start.extend_from_slice(&sdu[..mps - 2]);

            self.pending_segments.push_back((Segmentation::Start, start));

            let mut rest = &sdu[mps - 2..];

            while rest.len() > mps {
                self.pending_segments
                    .push_back((Segmentation::Continuation, rest[..mps].to_vec()));

                rest = &rest[mps..];
            }

            self.pending_segments.push_back((Segmentation::End, rest.to_vec()));
        }

        self.send_pending()
    }

    /// Send pending segments while the window has room
    fn send_pending(&mut self) -> Vec<ErtmAction> {
        let mut actions = Vec::new();

        while !self.remote_busy
            && self.unacked.len() < self.config.tx_window as usize
            && !self.pending_segments.is_empty()
        {
            let (segmentation, information) = self.pending_segments.pop_front().unwrap();

            let tx_seq = self.next_tx_seq;

            self.next_tx_seq = next_seq(self.next_tx_seq);

            actions.push(ErtmAction::SendFrame(self.build_i_frame(
                tx_seq,
                segmentation,
                &information,
            )));

            self.unacked.push_back(UnackedFrame {
                tx_seq,
                segmentation,
                information,
                transmit_count: 1,
            });

            if !self.retransmission_timer_running {
                self.retransmission_timer_running = true;

                actions.push(ErtmAction::StartRetransmissionTimer);
            }
        }

        actions
    }

    fn build_i_frame(&self, tx_seq: u8, segmentation: Segmentation, information: &[u8]) -> Vec<u8> {
        let control = ControlField::Information {
            tx_seq,
            req_seq: self.expected_tx_seq,
            segmentation,
            final_bit: false,
        };

        let mut frame = Vec::with_capacity(ControlField::SIZE + information.len());

        frame.extend_from_slice(&control.to_raw().to_le_bytes());
        frame.extend_from_slice(information);

        frame
    }

    fn build_s_frame(&self, function: Supervisory, poll: bool, final_bit: bool) -> Vec<u8> {
        let control = ControlField::Supervisory {
            function,
            req_seq: self.expected_tx_seq,
            poll,
            final_bit,
        };

        control.to_raw().to_le_bytes().to_vec()
    }

    /// Process a received PDU payload (FCS already validated and stripped)
    pub fn on_pdu(&mut self, payload: &[u8]) -> Vec<ErtmAction> {
        if payload.len() < ControlField::SIZE {
            return alloc::vec![ErtmAction::LinkFailure];
        }

        let control = ControlField::from_raw(u16::from_le_bytes([payload[0], payload[1]]));
        let information = &payload[ControlField::SIZE..];

        match control {
            ControlField::Information {
                tx_seq,
                req_seq,
                segmentation,
                ..
            } => {
                let mut actions = self.process_ack(req_seq);

                actions.extend(self.process_i_frame(tx_seq, segmentation, information));

                actions.extend(self.send_pending());

                actions
            }
            ControlField::Supervisory {
                function,
                req_seq,
                poll,
                ..
            } => {
                let mut actions = self.process_ack(req_seq);

                match function {
                    Supervisory::ReceiverReady => {
                        self.remote_busy = false;
                    }
                    Supervisory::ReceiverNotReady => {
                        self.remote_busy = true;
                    }
                    Supervisory::Reject => {
                        self.remote_busy = false;

                        actions.extend(self.retransmit_from(req_seq));
                    }
                    Supervisory::SelectiveReject => {
                        actions.extend(self.retransmit_one(req_seq));
                    }
                }

                if poll {
                    actions.push(ErtmAction::SendFrame(self.build_s_frame(
                        Supervisory::ReceiverReady,
                        false,
                        true,
                    )));
                }

                actions.extend(self.send_pending());

                actions
            }
        }
    }

    fn process_i_frame(
        &mut self,
        tx_seq: u8,
        segmentation: Segmentation,
        information: &[u8],
    ) -> Vec<ErtmAction> {
        let distance = seq_distance(self.expected_tx_seq, tx_seq);

        if distance >= self.config.tx_window {
            // behind the window: a duplicate of something already received
            return Vec::new();
        }

        if distance != 0 {
            // a gap; buffer and selectively reject the missing frame once
            let mut actions = Vec::new();

            self.out_of_order.insert(tx_seq, (segmentation, information.to_vec()));

            if !self.srej_sent {
                self.srej_sent = true;

                actions.push(ErtmAction::SendFrame(self.build_s_frame(
                    Supervisory::SelectiveReject,
                    false,
                    false,
                )));
            }

            return actions;
        }

        let mut actions = self.accept_in_order(segmentation, information.to_vec());

        // frames buffered past the gap may now be in order
        while let Some((segmentation, information)) = self.out_of_order.remove(&self.expected_tx_seq) {
            actions.extend(self.accept_in_order(segmentation, information));
        }

        self.srej_sent = false;

        actions.push(ErtmAction::SendFrame(self.build_s_frame(
            Supervisory::ReceiverReady,
            false,
            false,
        )));

        actions
    }

    fn accept_in_order(&mut self, segmentation: Segmentation, information: Vec<u8>) -> Vec<ErtmAction> {
        self.expected_tx_seq = next_seq(self.expected_tx_seq);

        match segmentation {
            Segmentation::Unsegmented => alloc::vec![ErtmAction::DeliverSdu(information)],
            Segmentation::Start => {
                if information.len() < 2 {
                    return alloc::vec![ErtmAction::LinkFailure];
                }

                let declared = u16::from_le_bytes([information[0], information[1]]) as usize;

                self.reassembly = Some((declared, information[2..].to_vec()));

                Vec::new()
            }
            Segmentation::Continuation => match self.reassembly.as_mut() {
                Some((_, buffer)) => {
                    buffer.extend_from_slice(&information);

                    Vec::new()
                }
                None => alloc::vec![ErtmAction::LinkFailure],
            },
            Segmentation::End => match self.reassembly.take() {
                Some((declared, mut buffer)) => {
                    buffer.extend_from_slice(&information);

                    if buffer.len() == declared {
                        alloc::vec![ErtmAction::DeliverSdu(buffer)]
                    } else {
                        alloc::vec![ErtmAction::LinkFailure]
                    }
                }
                None => alloc::vec![ErtmAction::LinkFailure],
            },
        }
    }

    /// Process the acknowledgment number of a received frame
    fn process_ack(&mut self, req_seq: u8) -> Vec<ErtmAction> {
        let acked = seq_distance(self.expected_ack_seq, req_seq);

        if acked as usize > self.unacked.len() {
            // acknowledging frames never sent
            return alloc::vec![ErtmAction::LinkFailure];
        }

        for _ in 0..acked {
            self.unacked.pop_front();
        }

        self.expected_ack_seq = req_seq;

        let mut actions = Vec::new();

        if acked != 0 {
            if self.unacked.is_empty() {
                if self.retransmission_timer_running {
                    self.retransmission_timer_running = false;

                    actions.push(ErtmAction::StopRetransmissionTimer);
                }

                actions.push(ErtmAction::StopMonitorTimer);
            } else {
                // restart the clock for the new oldest unacked frame
                actions.push(ErtmAction::StopRetransmissionTimer);
                actions.push(ErtmAction::StartRetransmissionTimer);

                self.retransmission_timer_running = true;
            }
        }

        actions
    }

    fn retransmit_from(&mut self, req_seq: u8) -> Vec<ErtmAction> {
        let mut actions = Vec::new();

        let retransmit: Vec<(u8, Segmentation, Vec<u8>)> = self
            .unacked
            .iter_mut()
            .filter(|frame| seq_distance(req_seq, frame.tx_seq) < self.config.tx_window)
            .map(|frame| {
                frame.transmit_count += 1;

                (frame.tx_seq, frame.segmentation, frame.information.clone())
            })
            .collect();

        if self
            .unacked
            .iter()
            .any(|frame| frame.transmit_count > self.config.max_transmissions)
        {
            return alloc::vec![ErtmAction::LinkFailure];
        }

        for (tx_seq, segmentation, information) in retransmit {
            actions.push(ErtmAction::SendFrame(self.build_i_frame(
                tx_seq,
                segmentation,
                &information,
            )));
        }

        actions
    }

    fn retransmit_one(&mut self, req_seq: u8) -> Vec<ErtmAction> {
        let frame = self.unacked.iter_mut().find(|frame| frame.tx_seq == req_seq);

        let Some(frame) = frame else { return Vec::new() };

        frame.transmit_count += 1;

        if frame.transmit_count > self.config.max_transmissions {
            return alloc::vec![ErtmAction::LinkFailure];
        }

        let (tx_seq, segmentation, information) =
            (frame.tx_seq, frame.segmentation, frame.information.clone());

        alloc::vec![ErtmAction::SendFrame(self.build_i_frame(
            tx_seq,
            segmentation,
            &information,
        ))]
    }

    /// The retransmission timer fired
    pub fn on_retransmission_timeout(&mut self) -> Vec<ErtmAction> {
        self.retransmission_timer_running = false;

        if self.unacked.is_empty() {
            return Vec::new();
        }

        let mut actions = self.retransmit_from(self.expected_ack_seq);

        if !actions.contains(&ErtmAction::LinkFailure) {
            actions.push(ErtmAction::StartMonitorTimer);
        }

        actions
    }

    /// The monitor timer fired
    pub fn on_monitor_timeout(&mut self) -> Vec<ErtmAction> {
        if self.unacked.is_empty() {
            return Vec::new();
        }

        let mut actions = self.retransmit_from(self.expected_ack_seq);

        if !actions.contains(&ErtmAction::LinkFailure) {
            actions.push(ErtmAction::StartMonitorTimer);
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ErtmEngine {
        ErtmEngine::new(ErtmConfig {
            tx_window: 4,
            max_transmissions: 3,
            mps: 16,
        })
    }

    fn sent_frames(actions: &[ErtmAction]) -> Vec<&Vec<u8>> {
        actions
            .iter()
            .filter_map(|action| match action {
                ErtmAction::SendFrame(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    fn control_of(frame: &[u8]) -> ControlField {
        ControlField::from_raw(u16::from_le_bytes([frame[0], frame[1]]))
    }

    fn rr(req_seq: u8) -> Vec<u8> {
        ControlField::Supervisory {
            function: Supervisory::ReceiverReady,
            req_seq,
            poll: false,
            final_bit: false,
        }
        .to_raw()
        .to_le_bytes()
        .to_vec()
    }

    fn i_frame(tx_seq: u8, req_seq: u8, information: &[u8]) -> Vec<u8> {
        let mut frame = ControlField::Information {
            tx_seq,
            req_seq,
            segmentation: Segmentation::Unsegmented,
            final_bit: false,
        }
        .to_raw()
        .to_le_bytes()
        .to_vec();

        frame.extend_from_slice(information);

        frame
    }

    #[test]
    fn small_sdu_is_one_unsegmented_frame() {
        let mut engine = engine();

        let actions = engine.queue_sdu(alloc::vec![1, 2, 3]);

        let frames = sent_frames(&actions);

        assert_eq!(1, frames.len());

        match control_of(frames[0]) {
            ControlField::Information {
                tx_seq,
                segmentation,
                ..
            } => {
                assert_eq!(0, tx_seq);
                assert_eq!(Segmentation::Unsegmented, segmentation);
            }
            other => panic!("expected an I-frame, built {:?}", other),
        }

        assert!(actions.contains(&ErtmAction::StartRetransmissionTimer));
    }

    #[test]
    fn large_sdu_segments_with_length_prefix() {
        let mut engine = engine();

        let sdu: Vec<u8> = (0u8..40).collect();

        let actions = engine.queue_sdu(sdu);

        let frames = sent_frames(&actions);

        // 16 byte MPS: start carries 14 bytes after the length, then 16, then the final 10
        assert_eq!(3, frames.len());

        match control_of(frames[0]) {
            ControlField::Information { segmentation, .. } => {
                assert_eq!(Segmentation::Start, segmentation)
            }
            other => panic!("expected an I-frame, built {:?}", other),
        }

        // the start information leads with the SDU length
        assert_eq!(&[40, 0], &frames[0][2..4]);

        match control_of(frames[2]) {
            ControlField::Information { segmentation, .. } => {
                assert_eq!(Segmentation::End, segmentation)
            }
            other => panic!("expected an I-frame, built {:?}", other),
        }
    }

    #[test]
    fn window_limits_outstanding_frames() {
        let mut engine = engine();

        for index in 0u8..6 {
            engine.queue_sdu(alloc::vec![index]);
        }

        assert_eq!(4, engine.unacked_frames());

        // acknowledge the first two; two pending frames go out
        let actions = engine.on_pdu(&rr(2));

        assert_eq!(2, sent_frames(&actions).len());
        assert_eq!(4, engine.unacked_frames());
    }

    #[test]
    fn in_order_receive_delivers_and_acks() {
        let mut engine = engine();

        let actions = engine.on_pdu(&i_frame(0, 0, &[9, 9]));

        assert!(actions.contains(&ErtmAction::DeliverSdu(alloc::vec![9, 9])));

        let frames = sent_frames(&actions);

        assert_eq!(1, frames.len());

        match control_of(frames[0]) {
            ControlField::Supervisory {
                function, req_seq, ..
            } => {
                assert_eq!(Supervisory::ReceiverReady, function);
                assert_eq!(1, req_seq);
            }
            other => panic!("expected an S-frame, built {:?}", other),
        }
    }

    #[test]
    fn out_of_order_triggers_selective_reject_then_reorders() {
        let mut engine = engine();

        // frame 1 arrives before frame 0
        let actions = engine.on_pdu(&i_frame(1, 0, &[1]));

        assert!(!actions.iter().any(|action| matches!(action, ErtmAction::DeliverSdu(_))));

        let frames = sent_frames(&actions);

        assert_eq!(1, frames.len());

        match control_of(frames[0]) {
            ControlField::Supervisory {
                function, req_seq, ..
            } => {
                assert_eq!(Supervisory::SelectiveReject, function);
                assert_eq!(0, req_seq);
            }
            other => panic!("expected an S-frame, built {:?}", other),
        }

        // the missing frame arrives; both deliver in order
        let actions = engine.on_pdu(&i_frame(0, 0, &[0]));

        let delivered: Vec<&Vec<u8>> = actions
            .iter()
            .filter_map(|action| match action {
                ErtmAction::DeliverSdu(sdu) => Some(sdu),
                _ => None,
            })
            .collect();

        assert_eq!(2, delivered.len());
        assert_eq!(&[0u8], delivered[0].as_slice());
        assert_eq!(&[1u8], delivered[1].as_slice());
    }

    #[test]
    fn duplicate_frames_are_dropped() {
        let mut engine = engine();

        engine.on_pdu(&i_frame(0, 0, &[7]));

        // tx_seq 0 again: behind the window, no delivery and no failure
        let actions = engine.on_pdu(&i_frame(0, 0, &[7]));

        assert!(!actions.iter().any(|action| matches!(action, ErtmAction::DeliverSdu(_))));
        assert!(!actions.contains(&ErtmAction::LinkFailure));
    }

    #[test]
    fn retransmission_exhaustion_fails_the_link() {
        let mut engine = engine();

        engine.queue_sdu(alloc::vec![1]);

        // transmissions: initial + 2 retransmits = 3 (the limit)
        assert!(!engine.on_retransmission_timeout().contains(&ErtmAction::LinkFailure));
        assert!(!engine.on_monitor_timeout().contains(&ErtmAction::LinkFailure));

        // a fourth transmission exceeds max_transmissions
        assert!(engine.on_monitor_timeout().contains(&ErtmAction::LinkFailure));
    }

    #[test]
    fn reject_goes_back_n() {
        let mut engine = engine();

        engine.queue_sdu(alloc::vec![0]);
        engine.queue_sdu(alloc::vec![1]);
        engine.queue_sdu(alloc::vec![2]);

        let actions = engine.on_pdu(
            &ControlField::Supervisory {
                function: Supervisory::Reject,
                req_seq: 1,
                poll: false,
                final_bit: false,
            }
            .to_raw()
            .to_le_bytes(),
        );

        // frame 0 is acknowledged, frames 1 and 2 retransmit
        let frames = sent_frames(&actions);

        assert_eq!(2, frames.len());

        let seqs: Vec<u8> = frames
            .iter()
            .map(|frame| match control_of(frame) {
                ControlField::Information { tx_seq, .. } => tx_seq,
                other => panic!("expected an I-frame, built {:?}", other),
            })
            .collect();

        assert_eq!(&[1, 2], seqs.as_slice());
    }
}
