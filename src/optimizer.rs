use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Device, Error, Result, Tensor, Var};
use candle_nn::{ParamsAdamW, VarMap};

struct NamedVar {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

/// AdamW over the variables of a `VarMap`. Moments are keyed by variable name so
/// the state can be written to and restored from a checkpoint.
pub struct AdamW {
    vars: Vec<NamedVar>,
    step_t: usize,
    params: ParamsAdamW,
}

impl AdamW {
    pub fn new(varmap: &VarMap, params: ParamsAdamW) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| Error::Msg(format!("varmap lock poisoned: {e}")))?;
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        let vars = names
            .into_iter()
            .filter_map(|name| {
                let var = data[name].clone();
                if !var.dtype().is_float() {
                    return None;
                }
                Some((name.clone(), var))
            })
            .map(|(name, var)| {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(NamedVar {
                    name,
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    pub fn new_lr(varmap: &VarMap, learning_rate: f64) -> Result<Self> {
        let params = ParamsAdamW {
            lr: learning_rate,
            ..ParamsAdamW::default()
        };
        Self::new(varmap, params)
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let lr = self.params.lr;
        let lambda = self.params.weight_decay;
        let lr_lambda = lr * lambda;
        let beta1 = self.params.beta1;
        let beta2 = self.params.beta2;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));
        for var in self.vars.iter() {
            let theta = &var.var;
            let m = &var.first_moment;
            let v = &var.second_moment;
            if let Some(g) = grads.get(theta) {
                let next_m = ((m.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
                let next_v = ((v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&next_m * scale_m)?;
                let v_hat = (&next_v * scale_v)?;
                let next_theta = (theta.as_tensor() * (1f64 - lr_lambda))?;
                let adjusted_grad = (m_hat / (v_hat.sqrt()? + self.params.eps)?)?;
                let next_theta = (next_theta - (adjusted_grad * lr)?)?;
                m.set(&next_m)?;
                v.set(&next_v)?;
                theta.set(&next_theta)?;
            }
        }
        Ok(())
    }

    /// Backpropagates `loss` and applies one update. Every call builds a fresh
    /// gradient store, so nothing accumulates between steps.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// Moments as `<name>.first_moment` / `<name>.second_moment`, plus `step`.
    pub fn state(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::with_capacity(self.vars.len() * 2 + 1);
        for var in &self.vars {
            state.insert(
                format!("{}.first_moment", var.name),
                var.first_moment.as_tensor().copy()?,
            );
            state.insert(
                format!("{}.second_moment", var.name),
                var.second_moment.as_tensor().copy()?,
            );
        }
        state.insert(
            "step".to_string(),
            Tensor::new(&[self.step_t as i64], &Device::Cpu)?,
        );
        Ok(state)
    }

    /// Inverse of [`AdamW::state`]. Every moment must be present with the
    /// shape of its variable.
    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for var in &self.vars {
            for (suffix, moment) in [
                ("first_moment", &var.first_moment),
                ("second_moment", &var.second_moment),
            ] {
                let key = format!("{}.{suffix}", var.name);
                let saved = state
                    .get(&key)
                    .ok_or_else(|| Error::Msg(format!("optimizer state is missing `{key}`")))?;
                moment.set(&saved.to_device(moment.device())?.to_dtype(moment.dtype())?)?;
            }
        }
        let step = state
            .get("step")
            .ok_or_else(|| Error::Msg("optimizer state is missing `step`".to_string()))?;
        self.step_t = step
            .to_dtype(DType::I64)?
            .flatten_all()?
            .to_vec1::<i64>()?
            .first()
            .copied()
            .ok_or_else(|| Error::Msg("optimizer `step` is empty".to_string()))?
            as usize;
        Ok(())
    }
}
