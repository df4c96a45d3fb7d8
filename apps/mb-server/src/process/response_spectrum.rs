use rayon::prelude::*;
use std::f64::consts::PI;

/// Damped single-degree-of-freedom oscillator driven through an explicit
/// Duhamel recursion. The recurrence is branch-free over the trace.
pub struct Oscillator {
    omega: f64,
    alpha: f64,
    beta: f64,
    gamma: f64,
    a: f64,
    b: f64,
    c: f64,
}

impl Oscillator {
    pub fn new(omega: f64, zeta: f64) -> Self {
        Self {
            omega,
            alpha: omega * zeta,
            beta: omega * (1.0 - zeta * zeta).sqrt(),
            gamma: 0.0,
            a: 0.0,
            b: 0.0,
            c: 0.0,
        }
    }

    fn factor(&self) -> f64 {
        self.gamma * self.a
    }

    fn amplitude(data: &[f64]) -> f64 {
        data.iter().fold(0.0f64, |acc, value| acc.max(value.abs()))
    }

    fn compute_parameter(&mut self, interval: f64) {
        let exp_term = (-self.alpha * interval).exp();

        self.a = exp_term * (self.beta * interval).sin() / self.beta;
        self.b = 2.0 * exp_term * (self.beta * interval).cos();
        self.c = exp_term * exp_term;

        self.gamma = (1.0 - self.b + self.c) / self.a / interval / (self.omega * self.omega);
    }

    fn populate(&self, motion: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let n = motion.len();
        let mut displacement = vec![0.0f64; n];
        if n > 1 {
            displacement[1] = self.b * displacement[0] - motion[0];
            for i in 2..n {
                displacement[i] =
                    self.b * displacement[i - 1] - self.c * displacement[i - 2] - motion[i - 1];
            }
        }

        let mut velocity = vec![0.0f64; n];
        for i in 1..n {
            velocity[i] = displacement[i] - displacement[i - 1];
        }

        let mut acceleration = vec![0.0f64; n];
        for i in 1..n {
            acceleration[i] = velocity[i] - velocity[i - 1];
        }

        (displacement, velocity, acceleration)
    }

    /// Peak responses `(Sd, Sv, Sa)` for one driving trace.
    pub fn compute_maximum_response(&mut self, interval: f64, motion: &[f64]) -> [f64; 3] {
        self.compute_parameter(interval);

        let (displacement, velocity, acceleration) = self.populate(motion);
        let factor = self.factor();

        let total_acceleration: Vec<f64> = acceleration
            .iter()
            .zip(motion)
            .map(|(a, x)| a * factor / interval + x)
            .collect();

        [
            Self::amplitude(&displacement) * factor * interval,
            Self::amplitude(&velocity) * factor,
            Self::amplitude(&total_acceleration),
        ]
    }
}

/// Response spectrum across the period bracket, parallelized per period.
/// The zero period degenerates to the rigid oscillator: `Sa = max|x|`,
/// `Sd = Sv = 0`.
pub fn response_spectrum(
    damping_ratio: f64,
    interval: f64,
    motion: &[f64],
    period: &[f64],
) -> Vec<[f64; 3]> {
    period
        .par_iter()
        .map(|t| {
            if *t == 0.0 {
                [0.0, 0.0, Oscillator::amplitude(motion)]
            } else {
                Oscillator::new(2.0 * PI / t, damping_ratio)
                    .compute_maximum_response(interval, motion)
            }
        })
        .collect()
}

/// `{start, start + step, …, period_end}`, both ends included.
pub fn period_range(period_start: f64, period_end: f64, period_step: f64) -> Vec<f64> {
    if period_step <= 0.0 || period_end < period_start {
        return vec![period_start.max(0.0)];
    }
    let mut period = Vec::new();
    let mut index = 0usize;
    loop {
        let t = period_start + index as f64 * period_step;
        if t > period_end + period_step / 2.0 {
            break;
        }
        period.push(t);
        index += 1;
    }
    period
}

/// `{0, step, 2·step, …, period_end}`; a zero step degenerates to the rigid
/// period alone.
pub fn period_bracket(period_end: f64, period_step: f64) -> Vec<f64> {
    period_range(0.0, period_end, period_step)
}
