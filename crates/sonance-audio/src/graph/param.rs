//! Parameter automation timelines
//!
//! Every audible parameter change on a running graph goes through an
//! `AudioParam` timeline: a base value plus time-stamped events. Only
//! freshly created nodes are assigned directly with [`AudioParam::set_value`].

/// A scheduled change on a parameter timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamEvent {
    /// Jump to `value` at `time`
    SetValue { value: f32, time: f64 },
    /// Ramp linearly from the previous event to `value`, arriving at `time`
    LinearRamp { value: f32, time: f64 },
}

impl ParamEvent {
    pub fn time(&self) -> f64 {
        match *self {
            ParamEvent::SetValue { time, .. } | ParamEvent::LinearRamp { time, .. } => time,
        }
    }

    pub fn value(&self) -> f32 {
        match *self {
            ParamEvent::SetValue { value, .. } | ParamEvent::LinearRamp { value, .. } => value,
        }
    }
}

/// An automatable node parameter
#[derive(Debug, Clone)]
pub struct AudioParam {
    base: f32,
    events: Vec<ParamEvent>,
}

impl AudioParam {
    pub fn new(value: f32) -> Self {
        Self {
            base: value,
            events: Vec::new(),
        }
    }

    /// Assign a value outright, discarding any automation.
    ///
    /// Only valid while the node has no audible history.
    pub fn set_value(&mut self, value: f32) {
        self.base = value;
        self.events.clear();
    }

    pub fn set_value_at_time(&mut self, value: f32, time: f64) {
        self.insert(ParamEvent::SetValue { value, time });
    }

    pub fn linear_ramp_to_value_at_time(&mut self, value: f32, time: f64) {
        self.insert(ParamEvent::LinearRamp { value, time });
    }

    /// Remove every event scheduled at or after `time`
    pub fn cancel_scheduled_values(&mut self, time: f64) {
        self.events.retain(|e| e.time() < time);
    }

    /// Ramp from whatever the parameter is doing at `now` to `target`,
    /// arriving `duration` seconds later.
    ///
    /// History before `now` is folded into the base value so timelines stay
    /// short on long-running nodes.
    pub fn ramp_to(&mut self, target: f32, now: f64, duration: f64) {
        let current = self.value_at(now);
        self.ramp_between(current, target, now, duration);
    }

    /// Like [`AudioParam::ramp_to`] but starting from an explicit value
    pub fn ramp_between(&mut self, from: f32, target: f32, now: f64, duration: f64) {
        self.base = from;
        self.events.clear();
        self.events.push(ParamEvent::SetValue { value: from, time: now });
        if duration > 0.0 {
            self.events.push(ParamEvent::LinearRamp {
                value: target,
                time: now + duration,
            });
        } else {
            self.events.push(ParamEvent::SetValue { value: target, time: now });
        }
    }

    /// Evaluate the timeline at time `t`
    pub fn value_at(&self, t: f64) -> f32 {
        let mut value = self.base;
        let mut prev_time = f64::NEG_INFINITY;

        for event in &self.events {
            match *event {
                ParamEvent::SetValue { value: v, time } => {
                    if time > t {
                        break;
                    }
                    value = v;
                    prev_time = time;
                }
                ParamEvent::LinearRamp { value: v, time } => {
                    if time <= t {
                        value = v;
                        prev_time = time;
                        continue;
                    }
                    if !prev_time.is_finite() || time <= prev_time {
                        return value;
                    }
                    let frac = ((t - prev_time) / (time - prev_time)).clamp(0.0, 1.0) as f32;
                    return value + (v - value) * frac;
                }
            }
        }

        value
    }

    /// The value the timeline settles on once every event has run
    pub fn target_value(&self) -> f32 {
        self.events.last().map(|e| e.value()).unwrap_or(self.base)
    }

    /// Time of the last scheduled event, if any
    pub fn end_time(&self) -> Option<f64> {
        self.events.last().map(|e| e.time())
    }

    pub fn events(&self) -> &[ParamEvent] {
        &self.events
    }

    fn insert(&mut self, event: ParamEvent) {
        let at = self
            .events
            .iter()
            .position(|e| e.time() > event.time())
            .unwrap_or(self.events.len());
        self.events.insert(at, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_value() {
        let param = AudioParam::new(0.7);
        assert_eq!(param.value_at(0.0), 0.7);
        assert_eq!(param.value_at(100.0), 0.7);
        assert_eq!(param.target_value(), 0.7);
        assert!(param.end_time().is_none());
    }

    #[test]
    fn test_linear_ramp_interpolates() {
        let mut param = AudioParam::new(1.0);
        param.ramp_to(0.0, 2.0, 1.0);

        assert!((param.value_at(1.0) - 1.0).abs() < 1e-6);
        assert!((param.value_at(2.5) - 0.5).abs() < 1e-6);
        assert!((param.value_at(3.0)).abs() < 1e-6);
        assert!((param.value_at(10.0)).abs() < 1e-6);
        assert_eq!(param.end_time(), Some(3.0));
    }

    #[test]
    fn test_ramp_anchors_at_current_value() {
        let mut param = AudioParam::new(0.0);
        param.ramp_to(1.0, 0.0, 1.0);
        // Interrupt halfway and head back down
        param.ramp_to(0.0, 0.5, 0.5);

        assert!((param.value_at(0.5) - 0.5).abs() < 1e-6);
        assert!((param.value_at(0.75) - 0.25).abs() < 1e-6);
        assert_eq!(param.target_value(), 0.0);
    }

    #[test]
    fn test_zero_duration_ramp_is_a_step() {
        let mut param = AudioParam::new(0.2);
        param.ramp_to(0.9, 4.0, 0.0);
        assert!((param.value_at(4.0) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_set_value_at_time_and_cancel() {
        let mut param = AudioParam::new(0.0);
        param.set_value_at_time(1.0, 2.0);
        param.set_value_at_time(0.5, 1.0);

        assert_eq!(param.value_at(1.5), 0.5);
        assert_eq!(param.value_at(2.5), 1.0);

        param.cancel_scheduled_values(2.0);
        assert_eq!(param.value_at(2.5), 0.5);
    }

    #[test]
    fn test_ramp_between_explicit_start() {
        let mut param = AudioParam::new(0.8);
        param.ramp_between(0.0, 0.8, 1.0, 2.0);
        assert!((param.value_at(1.0)).abs() < 1e-6);
        assert!((param.value_at(2.0) - 0.4).abs() < 1e-6);
    }
}
